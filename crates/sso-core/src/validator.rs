/// Email authorization check used at callback time and again by the proxy.
///
/// Matching is case-insensitive and `*` is a wildcard. When both addresses
/// and domains are configured, addresses take precedence.
#[derive(Clone, Debug)]
pub enum EmailValidator {
    Domains(Vec<String>),
    Addresses(Vec<String>),
}

impl EmailValidator {
    pub fn from_config(addresses: &[String], domains: &[String]) -> Self {
        if !addresses.is_empty() {
            EmailValidator::Addresses(
                addresses.iter().map(|a| a.to_ascii_lowercase()).collect(),
            )
        } else {
            EmailValidator::Domains(
                domains
                    .iter()
                    .map(|d| d.trim_start_matches('@').to_ascii_lowercase())
                    .collect(),
            )
        }
    }

    pub fn matches(&self, email: &str) -> bool {
        let email = email.to_ascii_lowercase();
        if !well_formed(&email) {
            return false;
        }
        match self {
            EmailValidator::Addresses(addresses) => addresses
                .iter()
                .any(|candidate| candidate == "*" || candidate == &email),
            EmailValidator::Domains(domains) => {
                let domain = match email.rsplit_once('@') {
                    Some((_, domain)) => domain,
                    None => return false,
                };
                domains
                    .iter()
                    .any(|candidate| candidate == "*" || candidate == domain)
            }
        }
    }
}

fn well_formed(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty() && !domain.contains('@'),
        None => false,
    }
}
