//! Self-signed TLS for the platform ingress.
//!
//! A certificate is issued once per cluster and kept in a `kubernetes.io/tls`
//! Secret; later runs reuse the stored pair.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair};
use tracing::info;

use crate::cluster::PlatformCluster;

/// Name of the ingress certificate Secret.
pub const TLS_SECRET_NAME: &str = "adhar-tls";

const CERT_KEY: &str = "tls.crt";
const KEY_KEY: &str = "tls.key";

/// PEM-encoded certificate and private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    /// Certificate.
    pub cert_pem: String,
    /// Private key.
    pub key_pem: String,
}

/// Issue a self-signed certificate for `domain` and its subdomains.
///
/// # Errors
///
/// Returns an error if key or certificate generation fails.
pub fn generate(domain: &str) -> Result<TlsMaterial> {
    let mut params = CertificateParams::new(vec![
        domain.to_string(),
        format!("*.{domain}"),
        "localhost".to_string(),
    ])
    .context("Invalid certificate subject names")?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(domain.to_string()));
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String("Adhar".to_string()),
    );
    params.distinguished_name = dn;
    params.not_before = rcgen::date_time_ymd(2024, 1, 1);
    params.not_after = rcgen::date_time_ymd(2034, 1, 1);

    let key_pair = KeyPair::generate().context("Failed to generate key pair")?;
    let cert = params
        .self_signed(&key_pair)
        .context("Failed to self-sign certificate")?;

    Ok(TlsMaterial {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// `kubernetes.io/tls` Secret manifest holding `material`.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn secret_manifest(namespace: &str, name: &str, material: &TlsMaterial) -> Result<String> {
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..ObjectMeta::default()
        },
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(BTreeMap::from([
            (
                CERT_KEY.to_string(),
                ByteString(material.cert_pem.as_bytes().to_vec()),
            ),
            (
                KEY_KEY.to_string(),
                ByteString(material.key_pem.as_bytes().to_vec()),
            ),
        ])),
        ..Secret::default()
    };
    let mut value = serde_json::to_value(&secret)?;
    value["apiVersion"] = "v1".into();
    value["kind"] = "Secret".into();
    Ok(serde_yaml::to_string(&value)?)
}

/// Return the stored certificate, issuing and storing one if absent.
///
/// # Errors
///
/// Returns an error if the Secret cannot be read or written.
pub async fn ensure_tls_secret(
    cluster: &dyn PlatformCluster,
    namespace: &str,
    domain: &str,
) -> Result<TlsMaterial> {
    if let Some(data) = cluster.secret_data(namespace, TLS_SECRET_NAME).await? {
        if let (Some(cert), Some(key)) = (data.get(CERT_KEY), data.get(KEY_KEY)) {
            info!(namespace, secret = TLS_SECRET_NAME, "Reusing existing TLS certificate");
            return Ok(TlsMaterial {
                cert_pem: String::from_utf8_lossy(cert).into_owned(),
                key_pem: String::from_utf8_lossy(key).into_owned(),
            });
        }
    }

    let material = generate(domain)?;
    cluster.ensure_namespace(namespace).await?;
    cluster
        .apply_manifest(&secret_manifest(namespace, TLS_SECRET_NAME, &material)?)
        .await
        .context("Failed to store TLS certificate")?;
    info!(namespace, domain, "Issued self-signed TLS certificate");
    Ok(material)
}
