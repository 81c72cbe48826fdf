use tracing::debug;

use crate::error::VaultError;

const HANDLE_PREFIX: &str = "keyring:";

/// Reversible seal for secrets stored at rest.
pub(crate) trait CredentialVault: Send + Sync {
    fn seal(&self, plaintext: &str) -> Result<String, VaultError>;

    fn unseal(&self, sealed: &str) -> Result<String, VaultError>;
}

/// Keeps the secret in the OS keychain; the sealed form written to the
/// credential cache is only a handle naming the keychain entry.
pub(crate) struct KeyringVault {
    service: String,
    account: String,
}

impl KeyringVault {
    pub(crate) fn new(service: &str, account: &str) -> Self {
        Self {
            service: service.to_string(),
            account: account.to_string(),
        }
    }

    fn entry(&self, account: &str) -> Result<keyring::Entry, VaultError> {
        Ok(keyring::Entry::new(&self.service, account)?)
    }
}

impl CredentialVault for KeyringVault {
    fn seal(&self, plaintext: &str) -> Result<String, VaultError> {
        let entry = self.entry(&self.account)?;
        if plaintext.is_empty() {
            match entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => {}
                Err(error) => return Err(error.into()),
            }
            return Ok(String::new());
        }

        entry.set_password(plaintext)?;
        debug!(account = %self.account, "secret stored in keychain");
        Ok(format!("{HANDLE_PREFIX}{}", self.account))
    }

    fn unseal(&self, sealed: &str) -> Result<String, VaultError> {
        if sealed.is_empty() {
            return Ok(String::new());
        }
        let account = parse_handle(sealed)?;
        Ok(self.entry(account)?.get_password()?)
    }
}

fn parse_handle(sealed: &str) -> Result<&str, VaultError> {
    match sealed.strip_prefix(HANDLE_PREFIX) {
        Some(account) if !account.is_empty() => Ok(account),
        _ => Err(VaultError::MalformedHandle),
    }
}
