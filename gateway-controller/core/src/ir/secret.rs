use super::ObjectSource;
use crate::collection::{Equals, Keyed};
use std::collections::BTreeMap;

pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_KEY_KEY: &str = "tls.key";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Secret {
    pub source: ObjectSource,
    pub data: BTreeMap<String, Vec<u8>>,
}

impl Keyed for Secret {
    fn resource_name(&self) -> String {
        self.source.resource_name()
    }
}

impl Equals for Secret {
    fn equals(&self, other: &Self) -> bool {
        self == other
    }
}

impl Secret {
    /// Returns the certificate chain and private key of a TLS secret.
    pub fn tls_pair(&self) -> Option<(&[u8], &[u8])> {
        let cert = self.data.get(TLS_CERT_KEY)?;
        let key = self.data.get(TLS_KEY_KEY)?;
        if cert.is_empty() || key.is_empty() {
            return None;
        }
        Some((cert, key))
    }
}
