//! Out-of-band provisioning of pending identities.
//!
//! An operator binds a device identity id to an employee and hands the
//! device its one-time token. The token is what later unlocks exactly one
//! certificate issuance.

use rand::rngs::OsRng;
use rand::Rng;
use rollcall_core::store::{EmployeeId, IdentityStore, PendingIdentity};
use tracing::info;

use crate::error::{IdentityError, Result};
use crate::pki::{validate_identity_id, validate_token};

/// Length of generated tokens.
pub const TOKEN_LEN: usize = 16;

const TOKEN_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Generate a one-time token from the OS CSPRNG (uppercase letters and digits).
pub fn generate_token() -> String {
    (0..TOKEN_LEN)
        .map(|_| TOKEN_ALPHABET[OsRng.gen_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

/// A freshly provisioned identity. The token must be delivered to the device
/// out of band; it is not retrievable from logs.
#[derive(Clone, PartialEq, Eq)]
pub struct ProvisionedIdentity {
    pub identity_id: String,
    pub one_time_token: String,
    pub employee_id: EmployeeId,
}

impl std::fmt::Debug for ProvisionedIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionedIdentity")
            .field("identity_id", &self.identity_id)
            .field("employee_id", &self.employee_id)
            .finish_non_exhaustive()
    }
}

pub struct Provisioner<S> {
    store: S,
}

impl<S: IdentityStore> Provisioner<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Create a pending identity. A token is generated unless one is given.
    pub fn provision(
        &self,
        identity_id: &str,
        employee_id: EmployeeId,
        token: Option<String>,
    ) -> Result<ProvisionedIdentity> {
        validate_identity_id(identity_id)?;
        let token = match token {
            Some(token) => {
                validate_token(&token)?;
                token
            }
            None => generate_token(),
        };

        self.store
            .insert_pending(PendingIdentity::new(identity_id, token.clone(), employee_id))
            .map_err(|e| match e {
                rollcall_core::Error::Constraint(_) => IdentityError::InvalidRequest(format!(
                    "identity {} or its token is already provisioned",
                    identity_id
                )),
                other => IdentityError::Store(other),
            })?;

        info!(identity_id = %identity_id, employee_id, "Identity provisioned");

        Ok(ProvisionedIdentity {
            identity_id: identity_id.to_string(),
            one_time_token: token,
            employee_id,
        })
    }
}
