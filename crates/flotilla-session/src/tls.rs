//! Transport certificate material for the agent gateway.
//!
//! Generates a self-signed control-plane CA and per-host certificates so
//! the stream endpoint can run over TLS. Envelope authentication (Ed25519)
//! is independent of this layer.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use tracing::info;

/// A generated certificate and private key pair, PEM encoded.
#[derive(Debug, Clone)]
pub struct CertKeyPair {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Generate the self-signed control-plane CA.
pub fn generate_ca() -> anyhow::Result<(CertKeyPair, KeyPair, rcgen::Certificate)> {
    let mut params = CertificateParams::default();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "Flotilla");
    dn.push(DnType::CommonName, "Flotilla Control Plane CA");
    params.distinguished_name = dn;

    params.not_after = rcgen::date_time_ymd(2036, 1, 1);

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    info!("generated control plane CA certificate");

    Ok((
        CertKeyPair {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        },
        key_pair,
        cert,
    ))
}

/// Generate a certificate for the gateway (or a host agent) signed by the
/// control-plane CA.
pub fn generate_host_cert(
    ca_key: &KeyPair,
    ca_cert: &rcgen::Certificate,
    common_name: &str,
    addresses: &[String],
) -> anyhow::Result<CertKeyPair> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "Flotilla");
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;

    for addr in addresses {
        if let Ok(ip) = addr.parse::<std::net::IpAddr>() {
            params.subject_alt_names.push(rcgen::SanType::IpAddress(ip));
        } else {
            params
                .subject_alt_names
                .push(rcgen::SanType::DnsName(addr.clone().try_into()?));
        }
    }

    params.not_after = rcgen::date_time_ymd(2027, 1, 1);

    let host_key = KeyPair::generate()?;
    let host_cert = params.signed_by(&host_key, ca_cert, ca_key)?;

    info!(%common_name, sans = addresses.len(), "generated host certificate");

    Ok(CertKeyPair {
        cert_pem: host_cert.pem(),
        key_pem: host_key.serialize_pem(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_ca_succeeds() {
        let (pair, _key, _cert) = generate_ca().unwrap();
        assert!(pair.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(pair.key_pem.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn generate_host_cert_with_ip_and_dns_sans() {
        let (_pair, ca_key, ca_cert) = generate_ca().unwrap();
        let cert = generate_host_cert(
            &ca_key,
            &ca_cert,
            "gateway",
            &["10.10.0.1".to_string(), "cp.flotilla.local".to_string()],
        )
        .unwrap();
        assert!(cert.cert_pem.contains("BEGIN CERTIFICATE"));
    }
}
