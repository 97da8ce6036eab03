use std::time::Duration;

use chrono::{DateTime, Utc};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::ec::{EcGroup, EcKey};
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509NameBuilder, X509Ref, X509ReqBuilder, X509};

use crate::{AcmeError, AcmeResult, KeyType};

/// An issued certificate chain paired with the private key of its CSR.
#[derive(Clone)]
pub struct CertBundle {
    chain: Vec<X509>,
    private_key_pem: Vec<u8>,
    dns_names: Vec<String>,
    not_after: DateTime<Utc>,
}

impl std::fmt::Debug for CertBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertBundle")
            .field("dns_names", &self.dns_names)
            .field("not_after", &self.not_after)
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

impl CertBundle {
    /// `chain_pem` is leaf first, as downloaded from the ACME server. The key
    /// is stored as given.
    pub fn from_pem(chain_pem: &[u8], private_key_pem: &[u8]) -> AcmeResult<Self> {
        let mut chain = vec![];
        for cert in rustls_pemfile::certs(&mut &*chain_pem) {
            let cert = cert.map_err(|e| AcmeError::Certificate(format!("read pem chain failed, {}", e)))?;
            let cert = X509::from_der(cert.as_ref())
                .map_err(|e| AcmeError::Certificate(format!("parse certificate failed, {}", e)))?;
            chain.push(cert);
        }

        let leaf = chain
            .first()
            .ok_or_else(|| AcmeError::Certificate("no certificate in chain".to_string()))?;
        let dns_names = leaf_dns_names(leaf);
        let not_after = asn1_time_to_utc(leaf.not_after())?;

        Ok(Self {
            chain,
            private_key_pem: private_key_pem.to_vec(),
            dns_names,
            not_after,
        })
    }

    pub fn leaf(&self) -> &X509 {
        &self.chain[0]
    }

    pub fn chain(&self) -> &[X509] {
        &self.chain
    }

    pub fn dns_names(&self) -> &[String] {
        &self.dns_names
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub fn private_key_pem(&self) -> &[u8] {
        &self.private_key_pem
    }

    pub fn chain_pem(&self) -> AcmeResult<Vec<u8>> {
        let mut pem = vec![];
        for cert in &self.chain {
            pem.extend_from_slice(&cert.to_pem()?);
        }
        Ok(pem)
    }

    /// Zero once expired.
    pub fn remaining_lifetime(&self) -> Duration {
        (self.not_after - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn needs_renewal(&self, renew_before_expiry: Duration) -> bool {
        self.remaining_lifetime() < renew_before_expiry
    }
}

/// Lower-cased DNS subject alternative names of `cert`.
pub fn leaf_dns_names(cert: &X509Ref) -> Vec<String> {
    cert.subject_alt_names()
        .map(|names| {
            names
                .iter()
                .filter_map(|name| name.dnsname())
                .map(|name| name.to_ascii_lowercase())
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn asn1_time_to_utc(time: &Asn1TimeRef) -> AcmeResult<DateTime<Utc>> {
    let diff = Asn1Time::from_unix(0)?.diff(time)?;
    let secs = diff.days as i64 * 24 * 3600 + diff.secs as i64;
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| AcmeError::Certificate(format!("certificate time out of range: {}", time)))
}

fn generate_key(key_type: KeyType) -> AcmeResult<PKey<Private>> {
    let key = match key_type {
        KeyType::Rsa2048 => PKey::from_rsa(Rsa::generate(2048)?)?,
        KeyType::Rsa4096 => PKey::from_rsa(Rsa::generate(4096)?)?,
        KeyType::EcdsaP256 => {
            let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
            PKey::from_ec_key(EcKey::generate(&group)?)?
        }
    };
    Ok(key)
}

/// Fresh key and a DER CSR for `domains`: the first name is the CN, all names
/// go into the SAN extension. Returns `(csr_der, private_key_pem)`.
pub fn generate_csr(domains: &[String], key_type: KeyType) -> AcmeResult<(Vec<u8>, Vec<u8>)> {
    let first = domains
        .first()
        .ok_or_else(|| AcmeError::InvalidDomain("csr without domains".to_string()))?;
    let pkey = generate_key(key_type)?;

    let mut builder = X509ReqBuilder::new()?;
    builder.set_pubkey(&pkey)?;

    let mut name_builder = X509NameBuilder::new()?;
    name_builder.append_entry_by_text("CN", first)?;
    builder.set_subject_name(&name_builder.build())?;

    let mut san = SubjectAlternativeName::new();
    for domain in domains {
        san.dns(domain);
    }
    let ext = san.build(&builder.x509v3_context(None))?;
    let mut stack = openssl::stack::Stack::new()?;
    stack.push(ext)?;
    builder.add_extensions(&stack)?;

    builder.sign(&pkey, openssl::hash::MessageDigest::sha256())?;

    Ok((builder.build().to_der()?, pkey.private_key_to_pem_pkcs8()?))
}
