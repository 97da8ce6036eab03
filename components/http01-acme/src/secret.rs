use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use openssl::pkey::PKey;
use openssl::x509::X509;

use crate::bundle::{asn1_time_to_utc, leaf_dns_names};
use crate::{normalize_domain, AcmeError, AcmeResult, CertBundle};

pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

/// Key/value material of a TLS secret.
pub type SecretData = HashMap<String, Vec<u8>>;

/// `tls.crt` holds the PEM chain, `tls.key` the PEM private key.
pub fn make_secret_data(bundle: &CertBundle) -> AcmeResult<SecretData> {
    let key = bundle.private_key_pem();
    if key.is_empty() {
        return Err(AcmeError::Certificate("bundle has no private key".to_string()));
    }
    PKey::private_key_from_pem(key)
        .map_err(|e| AcmeError::Certificate(format!("invalid private key, {}", e)))?;

    let mut data = SecretData::new();
    data.insert(TLS_CERT_KEY.to_string(), bundle.chain_pem()?);
    data.insert(TLS_PRIVATE_KEY_KEY.to_string(), key.to_vec());
    Ok(data)
}

/// Whether the stored certificate covers every name in `domains` and stays
/// valid for at least `minimum_lifespan`.
///
/// Missing material is `Ok(false)`. Material that is not PEM or not X.509 is
/// an error.
pub fn is_valid_certificate<S: AsRef<str>>(
    secret: &SecretData,
    domains: &[S],
    minimum_lifespan: Duration,
) -> AcmeResult<bool> {
    let cert_pem = match secret.get(TLS_CERT_KEY) {
        Some(pem) if !pem.is_empty() => pem,
        _ => return Ok(false),
    };

    let cert = X509::from_pem(cert_pem)
        .map_err(|e| AcmeError::Certificate(format!("parse {} failed, {}", TLS_CERT_KEY, e)))?;

    let dns_names = leaf_dns_names(&cert);
    for domain in domains {
        let domain = match normalize_domain(domain.as_ref()) {
            Ok(domain) => domain,
            Err(e) => {
                debug!("certificate cannot cover {}", e);
                return Ok(false);
            }
        };
        if !dns_names.contains(&domain) {
            debug!("certificate does not cover {}", domain);
            return Ok(false);
        }
    }

    let not_after = asn1_time_to_utc(cert.not_after())?;
    let remaining = (not_after - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    Ok(remaining >= minimum_lifespan)
}
