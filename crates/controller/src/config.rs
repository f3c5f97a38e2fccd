use std::time::Duration;

pub const DEFAULT_PLATFORM_NAMESPACE: &str = "default";
pub const DEFAULT_CONTROLLER_SA_NAMESPACE: &str = "kratix-platform-system";
pub const DEFAULT_CONTROLLER_SA_NAME: &str = "kratix-platform-controller-manager";
pub const DEFAULT_READER_IMAGE: &str = "bitnami/kubectl:1.20.10";
/// Placeholder only: the writer stage runs `kratix work-creator`, so `WC_IMG` must name an
/// image that ships the `kratix` binary.
pub const DEFAULT_WORK_CREATOR_IMAGE: &str = "syntasso/kratix-platform-work-creator:dev";
pub const DEFAULT_RETRY_SECS: u64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Works, pipeline pods, their config maps and service accounts live here.
    pub platform_namespace: String,
    pub controller_sa_namespace: String,
    pub controller_sa_name: String,
    pub work_creator_image: String,
    pub reader_image: String,
    /// Fixed delay for type propagation and delete-cascade retries.
    pub retry_after: Duration,
    /// Pins the pipeline pod suffix; random per launch otherwise.
    pub pod_suffix: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            platform_namespace: DEFAULT_PLATFORM_NAMESPACE.into(),
            controller_sa_namespace: DEFAULT_CONTROLLER_SA_NAMESPACE.into(),
            controller_sa_name: DEFAULT_CONTROLLER_SA_NAME.into(),
            work_creator_image: DEFAULT_WORK_CREATOR_IMAGE.into(),
            reader_image: DEFAULT_READER_IMAGE.into(),
            retry_after: Duration::from_secs(DEFAULT_RETRY_SECS),
            pod_suffix: None,
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Defaults overridden by whatever `lookup` yields. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |k: &str| lookup(k).filter(|v| !v.trim().is_empty());
        let mut cfg = Self::default();
        if let Some(v) = get("KRATIX_PLATFORM_NAMESPACE") { cfg.platform_namespace = v; }
        if let Some(v) = get("KRATIX_CONTROLLER_SA_NAMESPACE") { cfg.controller_sa_namespace = v; }
        if let Some(v) = get("KRATIX_CONTROLLER_SA_NAME") { cfg.controller_sa_name = v; }
        if let Some(v) = get("WC_IMG") { cfg.work_creator_image = v; }
        if let Some(v) = get("KRATIX_READER_IMAGE") { cfg.reader_image = v; }
        if let Some(v) = get("KRATIX_RETRY_SECS") {
            let secs: u64 = v
                .trim()
                .parse()
                .map_err(|e| ConfigError::Invalid { var: "KRATIX_RETRY_SECS", reason: format!("{}: {}", v, e) })?;
            cfg.retry_after = Duration::from_secs(secs);
        }
        cfg.pod_suffix = get("TEST_PROMISE_CONTROLLER_POD_IDENTIFIER_UUID");
        Ok(cfg)
    }

    /// False until `WC_IMG` points the writer stage at a real image.
    pub fn work_creator_image_is_set(&self) -> bool {
        self.work_creator_image != DEFAULT_WORK_CREATOR_IMAGE
    }

    /// Five characters unless pinned.
    pub fn pod_suffix(&self) -> String {
        match &self.pod_suffix {
            Some(s) => s.clone(),
            None => uuid::Uuid::new_v4().simple().to_string()[..5].to_string(),
        }
    }
}
