use std::collections::BTreeSet;
use std::fmt::Display;

use crate::{AcmeError, AcmeResult};

/// Deduplicated, order-independent set of DNS names covered by one order.
///
/// The canonical key is the sorted names joined by `,`, so `["b.com", "a.com"]`
/// and `["A.com", "b.com", "a.com"]` name the same set. Subsets and supersets
/// are different sets.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DomainSet {
    names: BTreeSet<String>,
}

impl DomainSet {
    pub fn new<S: AsRef<str>>(domains: &[S]) -> AcmeResult<Self> {
        let mut names = BTreeSet::new();
        for domain in domains {
            names.insert(normalize_domain(domain.as_ref())?);
        }
        if names.is_empty() {
            return Err(AcmeError::InvalidDomain("domain set is empty".to_string()));
        }
        Ok(Self { names })
    }

    pub fn key(&self) -> String {
        self.names.iter().cloned().collect::<Vec<_>>().join(",")
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.names.iter()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.names.iter().cloned().collect()
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.names.contains(domain)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Display for DomainSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Lower-cases, trims and strips the trailing root dot, then checks DNS syntax.
/// Wildcards are rejected: HTTP-01 cannot prove control of them.
pub fn normalize_domain(domain: &str) -> AcmeResult<String> {
    let name = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    if name.is_empty() {
        return Err(AcmeError::InvalidDomain(format!("empty domain name {:?}", domain)));
    }
    if name.len() > 253 {
        return Err(AcmeError::InvalidDomain(format!("domain name too long: {}", name)));
    }

    for label in name.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(AcmeError::InvalidDomain(format!("invalid label in {}", name)));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(AcmeError::InvalidDomain(format!("label starts or ends with '-' in {}", name)));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(AcmeError::InvalidDomain(format!("invalid character in {}", name)));
        }
    }

    Ok(name)
}
