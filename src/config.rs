use crate::error::{Result, ServiceError};
use crate::secrets::SecretKind;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

/// Caller identity: preprocessor inputs plus the proxy-topology key.
/// Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostParameters {
    pub machine: String,
    pub stamp: String,
    pub ring: String,
    pub environment: String,
    pub configuration_id: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Host parameters plus the authorization material of one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentParameters {
    #[serde(flatten)]
    pub host: HostParameters,
    pub authorization_secret_name: String,
    pub authorization_secret: String,
    /// Suppresses uploads; manifest entries come back without download URLs.
    #[serde(default)]
    pub get_content_info_only: bool,
}

/// One file in a drop. The hash is the primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSpec {
    pub hash: String,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

/// On-disk catalogue of every drop available under the deployment root.
/// Immutable relative to a given root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentManifest {
    /// Drop url → file relative path → file entry.
    #[serde(default)]
    pub drops: BTreeMap<String, BTreeMap<String, FileSpec>>,
    /// The deployment-configuration blob, stored content-addressed like
    /// every other entry.
    pub configuration: FileSpec,
}

/// A named secret, its cache lifetime, and how its value is interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretConfiguration {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(with = "humantime_serde")]
    pub time_to_live: Duration,
    pub kind: SecretKind,
}

impl SecretConfiguration {
    /// The vault name, or `Malformed` when the configuration left it out
    /// and no fallback applies.
    pub fn resolved_name(&self) -> Result<&str> {
        self.name
            .as_deref()
            .ok_or_else(|| ServiceError::malformed("secret configuration is missing a name"))
    }
}

/// Launch command for the tool the caller materialises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfiguration {
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
    /// Env var name → secret to resolve into it at manifest time.
    #[serde(default)]
    pub secret_environment_variables: BTreeMap<String, SecretConfiguration>,
}

/// A source drop and where its files land relative to the tool root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropConfiguration {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub target_relative_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyServiceConfiguration {
    pub port: u16,
    pub deployment_service_url: String,
    #[serde(with = "humantime_serde")]
    pub proxy_address_time_to_live: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfiguration {
    pub domain: String,
    pub seeds: usize,
    pub fan_out_factor: usize,
    /// Where the deployment-configuration blob itself lands on the caller.
    pub target_relative_path: String,
    pub service_configuration: ProxyServiceConfiguration,
}

/// Per-caller preprocessed configuration, deserialized from the blob the
/// deployment manifest points at. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfiguration {
    pub tool: ToolConfiguration,
    #[serde(default)]
    pub drops: Vec<DropConfiguration>,
    pub azure_storage_secret_info: SecretConfiguration,
    #[serde(default)]
    pub authorization_secret_names: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub authorization_secret_time_to_live: Duration,
    #[serde(default)]
    pub key_vault_uri: String,
    #[serde(with = "humantime_serde")]
    pub sas_url_time_to_live: Duration,
    #[serde(default)]
    pub proxy: Option<ProxyConfiguration>,
}

/// Content-addressed catalogue returned to the launcher.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LauncherManifest {
    pub content_id: String,
    pub tool: ToolConfiguration,
    pub drops: Vec<DropConfiguration>,
    /// Target relative path → file, download URL populated unless the
    /// caller asked for content info only or the upload is still pending.
    pub deployment: BTreeMap<String, FileSpec>,
    pub is_complete: bool,
}

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z][A-Za-z0-9_]*)\}").unwrap());

/// Purely textual substitution of `{Token}` placeholders in the raw
/// configuration. The standard keys (`{Stamp}`, `{Machine}`, `{Ring}`,
/// `{Environment}`, `{ConfigurationId}`) win over caller properties of the
/// same name; any token left unresolved fails the request.
pub fn preprocess(raw: &str, params: &HostParameters) -> Result<String> {
    let mut replacements = params.properties.clone();
    replacements.insert("Stamp".to_string(), params.stamp.clone());
    replacements.insert("Machine".to_string(), params.machine.clone());
    replacements.insert("Ring".to_string(), params.ring.clone());
    replacements.insert("Environment".to_string(), params.environment.clone());
    replacements.insert(
        "ConfigurationId".to_string(),
        params.configuration_id.clone(),
    );

    let mut unresolved = Vec::new();
    let substituted = TOKEN.replace_all(raw, |caps: &Captures| match replacements.get(&caps[1]) {
        Some(value) => value.clone(),
        None => {
            unresolved.push(caps[1].to_string());
            String::new()
        }
    });
    if !unresolved.is_empty() {
        unresolved.sort();
        unresolved.dedup();
        return Err(ServiceError::malformed(format!(
            "unresolved preprocessor tokens: {}",
            unresolved.join(", ")
        )));
    }
    Ok(substituted.into_owned())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn host_parameters(machine: &str) -> HostParameters {
        HostParameters {
            machine: machine.to_string(),
            stamp: "stamp1".to_string(),
            ring: "ring0".to_string(),
            environment: "prod".to_string(),
            configuration_id: "cfg7".to_string(),
            properties: BTreeMap::new(),
        }
    }

    #[test]
    fn preprocess_substitutes_standard_keys() {
        let raw = r#"{"stamp":"{Stamp}","machine":"{Machine}","ring":"{Ring}"}"#;
        let result = preprocess(raw, &host_parameters("m0")).unwrap();
        assert_eq!(result, r#"{"stamp":"stamp1","machine":"m0","ring":"ring0"}"#);
    }

    #[test]
    fn preprocess_substitutes_caller_properties() {
        let mut params = host_parameters("m0");
        params
            .properties
            .insert("Region".to_string(), "westus".to_string());
        let result = preprocess(r#"{"region":"{Region}"}"#, &params).unwrap();
        assert_eq!(result, r#"{"region":"westus"}"#);
    }

    #[test]
    fn standard_keys_shadow_colliding_properties() {
        let mut params = host_parameters("m0");
        params
            .properties
            .insert("Stamp".to_string(), "spoofed".to_string());
        let result = preprocess("{Stamp}", &params).unwrap();
        assert_eq!(result, "stamp1");
    }

    #[test]
    fn preprocess_is_idempotent_per_parameters() {
        let raw = r#"{"id":"{ConfigurationId}","env":"{Environment}"}"#;
        let params = host_parameters("m0");
        assert_eq!(
            preprocess(raw, &params).unwrap(),
            preprocess(raw, &params).unwrap()
        );
    }

    #[test]
    fn unresolved_tokens_are_fatal_for_the_request() {
        let err = preprocess(r#"{"x":"{Mystery}"}"#, &host_parameters("m0")).unwrap_err();
        assert_eq!(
            err,
            ServiceError::malformed("unresolved preprocessor tokens: Mystery")
        );
    }

    #[test]
    fn json_braces_are_not_tokens() {
        let raw = r#"{"empty":{},"nested":{"a":1}}"#;
        assert_eq!(preprocess(raw, &host_parameters("m0")).unwrap(), raw);
    }

    #[test]
    fn manifest_round_trips_through_json() {
        let mut files = BTreeMap::new();
        files.insert(
            "file.txt".to_string(),
            FileSpec {
                hash: "ab12".to_string(),
                size: 10,
                download_url: None,
            },
        );
        let mut drops = BTreeMap::new();
        drops.insert("https://drops/u1".to_string(), files);
        let manifest = DeploymentManifest {
            drops,
            configuration: FileSpec {
                hash: "cd34".to_string(),
                size: 99,
                download_url: None,
            },
        };

        let json = serde_json::to_string(&manifest).unwrap();
        let parsed: DeploymentManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn configuration_parse_is_lenient_about_unknown_fields() {
        let json = r#"{
            "tool": {"executable": "bin/tool", "futureField": 1},
            "azureStorageSecretInfo": {"name": "store-sas", "timeToLive": "30m", "kind": "SasToken"},
            "authorizationSecretNames": ["deploy-key"],
            "authorizationSecretTimeToLive": "10m",
            "sasUrlTimeToLive": "1h",
            "somethingNew": {"ignored": true}
        }"#;
        let config: DeploymentConfiguration = serde_json::from_str(json).unwrap();
        assert_eq!(config.tool.executable, "bin/tool");
        assert_eq!(config.sas_url_time_to_live, Duration::from_secs(3600));
        assert_eq!(config.azure_storage_secret_info.kind, SecretKind::SasToken);
        assert!(config.proxy.is_none());
    }
}
