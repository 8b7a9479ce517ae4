/// Holds cluster metadata and controller settings.
#[derive(Clone, Debug)]
pub struct ClusterInfo {
    /// The controller name that GatewayClasses must name for their gateways to
    /// be managed.
    pub controller_name: String,

    /// The GatewayClass managed when no such class object exists.
    pub gateway_class: String,

    /// E.g. "cluster.local"
    pub dns_domain: String,

    /// The mesh trust domain, used in upstream SNI names.
    pub trust_domain: String,

    /// Whether endpoints are tagged for Istio auto-mTLS.
    pub enable_auto_mtls: bool,
}

impl Default for ClusterInfo {
    fn default() -> Self {
        Self {
            controller_name: gateway_controller_core::DEFAULT_CONTROLLER_NAME.to_string(),
            gateway_class: gateway_controller_core::DEFAULT_GATEWAY_CLASS.to_string(),
            dns_domain: "cluster.local".to_string(),
            trust_domain: "cluster.local".to_string(),
            enable_auto_mtls: false,
        }
    }
}

impl ClusterInfo {
    pub fn service_dns_name(&self, ns: &str, svc: &str) -> String {
        format!("{svc}.{ns}.svc.{}", self.dns_domain)
    }
}
