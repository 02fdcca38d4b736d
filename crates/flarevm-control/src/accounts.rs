//! User accounts and SSH keys.
//!
//! Like [`catalog`](crate::catalog), these functions take the store directly
//! and are driven by the service.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use chrono::Utc;
use flarevm_core::{Actor, Role, SshKeyId, UserId};
use flarevm_store::{NewUser, SshKey, Store, User};
use sha2::{Digest, Sha256};

use crate::catalog::require_admin;
use crate::error::{ControlError, Result};
use crate::types::{
    CreateSshKeyRequest, CreateUserRequest, SshAuthRequest, SshAuthResponse, UpdateSshKeyRequest,
    UpdateUserRequest,
};

/// Key types accepted for registration.
const KEY_TYPES: &[&str] = &[
    "ssh-ed25519",
    "ssh-rsa",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "sk-ssh-ed25519@openssh.com",
    "sk-ecdsa-sha2-nistp256@openssh.com",
];

// =============================================================================
// Users
// =============================================================================

fn validate_user_fields(username: &str, email: &str) -> Result<()> {
    if username.trim().is_empty() {
        return Err(ControlError::InvalidSpec("username must not be empty".into()));
    }
    let valid_email = email
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
    if !valid_email {
        return Err(ControlError::InvalidSpec(format!("invalid email: {email}")));
    }
    Ok(())
}

fn require_self_or_admin(actor: &Actor, user_id: UserId) -> Result<()> {
    if actor.can_access(user_id) {
        Ok(())
    } else {
        Err(ControlError::Forbidden(format!(
            "user {} cannot access user {user_id}",
            actor.user_id
        )))
    }
}

/// List all users.
///
/// # Errors
///
/// Returns `Forbidden` for non-admins.
pub fn list_users<S: Store>(store: &S, actor: &Actor) -> Result<Vec<User>> {
    require_admin(actor, "listing users")?;
    Ok(store.list_users()?)
}

/// Get a user. Users may read their own record.
///
/// # Errors
///
/// Returns `Forbidden` or `UserNotFound`.
pub fn get_user<S: Store>(store: &S, actor: &Actor, user_id: UserId) -> Result<User> {
    require_self_or_admin(actor, user_id)?;
    store
        .get_user(user_id)?
        .ok_or(ControlError::UserNotFound(user_id))
}

/// Create a user.
///
/// # Errors
///
/// Returns `Forbidden` for non-admins, `InvalidSpec` for bad fields and
/// `Conflict` if the email is registered.
pub fn create_user<S: Store>(store: &S, actor: &Actor, request: CreateUserRequest) -> Result<User> {
    require_admin(actor, "creating users")?;

    let username = request.username.trim().to_string();
    let email = request.email.trim().to_string();
    validate_user_fields(&username, &email)?;

    let user = store.create_user(NewUser {
        username,
        email,
        role: request.role,
    })?;

    tracing::info!(user_id = %user.user_id, role = user.role.as_str(), "Created user");
    Ok(user)
}

/// Update a user. Users may edit their own profile but not their role.
///
/// # Errors
///
/// Returns `Forbidden`, `UserNotFound`, `InvalidSpec` or `Conflict`.
pub fn update_user<S: Store>(
    store: &S,
    actor: &Actor,
    user_id: UserId,
    request: UpdateUserRequest,
) -> Result<User> {
    require_self_or_admin(actor, user_id)?;

    let mut user = store
        .get_user(user_id)?
        .ok_or(ControlError::UserNotFound(user_id))?;

    if let Some(role) = request.role {
        if role != user.role {
            require_admin(actor, "changing roles")?;
            if actor.user_id == user_id && role == Role::User {
                return Err(ControlError::Conflict(
                    "admins cannot demote themselves".into(),
                ));
            }
            user.role = role;
        }
    }
    if let Some(username) = request.username {
        user.username = username.trim().to_string();
    }
    if let Some(email) = request.email {
        user.email = email.trim().to_string();
    }
    validate_user_fields(&user.username, &user.email)?;
    user.updated_at = Utc::now();

    store.update_user(&user)?;

    tracing::info!(user_id = %user_id, "Updated user");
    Ok(user)
}

/// Delete a user who owns no VMs, along with their SSH keys.
///
/// # Errors
///
/// Returns `Forbidden` for non-admins, `UserNotFound`, and `Conflict` if the
/// user still owns VMs.
pub fn delete_user<S: Store>(store: &S, actor: &Actor, user_id: UserId) -> Result<()> {
    require_admin(actor, "deleting users")?;
    if actor.user_id == user_id {
        return Err(ControlError::Conflict("admins cannot delete themselves".into()));
    }

    store
        .get_user(user_id)?
        .ok_or(ControlError::UserNotFound(user_id))?;

    let owned = store.count_vms_by_user(user_id)?;
    if owned > 0 {
        return Err(ControlError::Conflict(format!(
            "user {user_id} still owns {owned} VMs"
        )));
    }

    for key in store.list_ssh_keys_by_user(user_id)? {
        store.delete_ssh_key(&key.key_id)?;
    }
    store.delete_user(user_id)?;

    tracing::info!(user_id = %user_id, "Deleted user");
    Ok(())
}

// =============================================================================
// SSH Keys
// =============================================================================

/// A parsed OpenSSH public key line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    /// Key type, e.g. `ssh-ed25519`.
    pub key_type: String,
    /// Decoded key blob.
    pub blob: Vec<u8>,
    /// Trailing comment, if any.
    pub comment: Option<String>,
}

impl PublicKey {
    /// The `SHA256:` fingerprint, as printed by `ssh-keygen -l`.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.blob)
    }

    /// The canonical `type blob [comment]` line.
    #[must_use]
    pub fn to_line(&self) -> String {
        let encoded = STANDARD.encode(&self.blob);
        match &self.comment {
            Some(comment) => format!("{} {encoded} {comment}", self.key_type),
            None => format!("{} {encoded}", self.key_type),
        }
    }
}

/// `SHA256:` fingerprint of a key blob.
#[must_use]
pub fn fingerprint(blob: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(blob)))
}

/// Parse an OpenSSH public key line.
///
/// The blob must decode and must name the same key type as the line.
///
/// # Errors
///
/// Returns `ControlError::InvalidSpec` if the line is not a supported key.
pub fn parse_public_key(line: &str) -> Result<PublicKey> {
    let invalid = |why: &str| ControlError::InvalidSpec(format!("invalid SSH public key: {why}"));

    let mut parts = line.split_whitespace();
    let key_type = parts.next().ok_or_else(|| invalid("empty"))?;
    if !KEY_TYPES.contains(&key_type) {
        return Err(invalid(&format!("unsupported key type {key_type}")));
    }

    let encoded = parts.next().ok_or_else(|| invalid("missing key data"))?;
    let blob = STANDARD
        .decode(encoded)
        .map_err(|_| invalid("key data is not base64"))?;

    // The blob starts with the length-prefixed key type
    let (embedded, rest) = split_field(&blob).ok_or_else(|| invalid("truncated key data"))?;
    if embedded != key_type.as_bytes() {
        return Err(invalid("key type does not match key data"));
    }
    match split_field(rest) {
        Some((material, _)) if !material.is_empty() => {}
        _ => return Err(invalid("missing key material")),
    }

    let comment = parts.collect::<Vec<_>>().join(" ");

    Ok(PublicKey {
        key_type: key_type.to_string(),
        blob,
        comment: (!comment.is_empty()).then_some(comment),
    })
}

/// Split one length-prefixed field off the front of a key blob.
fn split_field(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let len = u32::from_be_bytes(data.get(..4)?.try_into().ok()?) as usize;
    let end = len.checked_add(4)?;
    Some((data.get(4..end)?, data.get(end..)?))
}

/// Get an SSH key the caller may see.
fn get_owned_key<S: Store>(store: &S, actor: &Actor, key_id: &SshKeyId) -> Result<SshKey> {
    let key = store
        .get_ssh_key(key_id)?
        .ok_or_else(|| ControlError::ssh_key_not_found(key_id))?;
    if actor.can_access(key.user_id) {
        Ok(key)
    } else {
        Err(ControlError::Forbidden(format!(
            "SSH key {key_id} belongs to another user"
        )))
    }
}

/// List the caller's SSH keys.
///
/// # Errors
///
/// Returns an error if the database operation fails.
pub fn list_ssh_keys<S: Store>(store: &S, actor: &Actor) -> Result<Vec<SshKey>> {
    Ok(store.list_ssh_keys_by_user(actor.user_id)?)
}

/// Get an SSH key.
///
/// # Errors
///
/// Returns `SshKeyNotFound` or `Forbidden`.
pub fn get_ssh_key<S: Store>(store: &S, actor: &Actor, key_id: &SshKeyId) -> Result<SshKey> {
    get_owned_key(store, actor, key_id)
}

/// Register an SSH key for the caller.
///
/// # Errors
///
/// Returns `InvalidSpec` for a malformed key and `Conflict` if the key is
/// already registered.
pub fn create_ssh_key<S: Store>(
    store: &S,
    actor: &Actor,
    request: CreateSshKeyRequest,
) -> Result<SshKey> {
    let name = request.name.trim().to_string();
    if name.is_empty() {
        return Err(ControlError::InvalidSpec("name must not be empty".into()));
    }
    let parsed = parse_public_key(&request.public_key)?;

    let key = SshKey {
        key_id: SshKeyId::generate(),
        user_id: actor.user_id,
        name,
        public_key: parsed.to_line(),
        fingerprint: parsed.fingerprint(),
        created_at: Utc::now(),
        last_used_at: None,
    };
    store.put_ssh_key(&key)?;

    tracing::info!(
        key_id = %key.key_id,
        user_id = %key.user_id,
        fingerprint = %key.fingerprint,
        "Registered SSH key"
    );
    Ok(key)
}

/// Rename an SSH key.
///
/// # Errors
///
/// Returns `SshKeyNotFound`, `Forbidden` or `InvalidSpec`.
pub fn update_ssh_key<S: Store>(
    store: &S,
    actor: &Actor,
    key_id: &SshKeyId,
    request: UpdateSshKeyRequest,
) -> Result<SshKey> {
    let mut key = get_owned_key(store, actor, key_id)?;
    let name = request.name.trim().to_string();
    if name.is_empty() {
        return Err(ControlError::InvalidSpec("name must not be empty".into()));
    }
    key.name = name;
    store.put_ssh_key(&key)?;
    Ok(key)
}

/// Delete an SSH key.
///
/// # Errors
///
/// Returns `SshKeyNotFound` or `Forbidden`.
pub fn delete_ssh_key<S: Store>(store: &S, actor: &Actor, key_id: &SshKeyId) -> Result<()> {
    get_owned_key(store, actor, key_id)?;
    store.delete_ssh_key(key_id)?;
    tracing::info!(key_id = %key_id, "Deleted SSH key");
    Ok(())
}

/// Check a key presented to a VM's SSH daemon and record its use.
///
/// # Errors
///
/// Returns `InvalidSpec` if no key is given, `SshKeyNotFound` for an unknown
/// key, `VmNotFound` for an unknown VM, and `Forbidden` if the key owner has
/// no access to the VM.
pub fn authenticate_ssh_key<S: Store>(
    store: &S,
    request: &SshAuthRequest,
) -> Result<SshAuthResponse> {
    let fingerprint = match (&request.fingerprint, &request.public_key) {
        (Some(fingerprint), _) => fingerprint.trim().to_string(),
        (None, Some(public_key)) => parse_public_key(public_key)?.fingerprint(),
        (None, None) => {
            return Err(ControlError::InvalidSpec(
                "fingerprint or public_key is required".into(),
            ))
        }
    };

    let mut key = store
        .get_ssh_key_by_fingerprint(&fingerprint)?
        .ok_or_else(|| ControlError::SshKeyNotFound(fingerprint.clone()))?;

    if let Some(vm_id) = &request.vm_id {
        let vm = store.get_vm(vm_id)?.ok_or(ControlError::VmNotFound(*vm_id))?;
        let is_admin = store
            .get_user(key.user_id)?
            .is_some_and(|user| user.role == Role::Admin);
        if vm.user_id != key.user_id && !is_admin {
            tracing::warn!(vm_id = %vm_id, key_id = %key.key_id, "SSH key rejected for VM");
            return Err(ControlError::Forbidden(format!(
                "key {fingerprint} has no access to VM {vm_id}"
            )));
        }
    }

    key.last_used_at = Some(Utc::now());
    store.put_ssh_key(&key)?;

    tracing::debug!(key_id = %key.key_id, user_id = %key.user_id, "SSH key authenticated");

    Ok(SshAuthResponse {
        user_id: key.user_id,
        key_id: key.key_id,
        fingerprint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flarevm_store::RocksStore;
    use tempfile::TempDir;

    const ALICE_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAICZrIWHIcJdlj68690o4KbyUXB/uLIGTJfLizgmr6p/1 alice@laptop";
    const ALICE_FINGERPRINT: &str = "SHA256:pZNtezqLHsd5KjrebdP3/j5YTqaupirjfECmlMcn2ak";

    fn setup() -> (TempDir, RocksStore, Actor) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        let admin = store
            .create_user(NewUser {
                username: "root".to_string(),
                email: "root@example.com".to_string(),
                role: Role::Admin,
            })
            .unwrap();
        (dir, store, Actor::admin(admin.user_id))
    }

    fn create_alice(store: &RocksStore, admin: &Actor) -> User {
        create_user(
            store,
            admin,
            CreateUserRequest {
                username: "alice".to_string(),
                email: "alice@example.com".to_string(),
                role: Role::User,
            },
        )
        .unwrap()
    }

    #[test]
    fn parse_and_fingerprint_ed25519() {
        let key = parse_public_key(ALICE_KEY).unwrap();
        assert_eq!(key.key_type, "ssh-ed25519");
        assert_eq!(key.comment.as_deref(), Some("alice@laptop"));
        assert_eq!(key.fingerprint(), ALICE_FINGERPRINT);
        assert_eq!(key.to_line(), ALICE_KEY);
    }

    #[test]
    fn parse_rejects_malformed_keys() {
        assert!(parse_public_key("").is_err());
        assert!(parse_public_key("ssh-dss AAAA").is_err());
        assert!(parse_public_key("ssh-ed25519 not*base64").is_err());
        // Blob says ssh-ed25519, line says ssh-rsa
        assert!(parse_public_key(&ALICE_KEY.replacen("ssh-ed25519", "ssh-rsa", 1)).is_err());
    }

    #[test]
    fn parse_requires_key_material() {
        let type_only = {
            let mut blob = 11_u32.to_be_bytes().to_vec();
            blob.extend_from_slice(b"ssh-ed25519");
            blob
        };
        let line = format!("ssh-ed25519 {}", STANDARD.encode(&type_only));
        assert!(matches!(parse_public_key(&line), Err(ControlError::InvalidSpec(_))));

        let mut empty_material = type_only;
        empty_material.extend_from_slice(&0_u32.to_be_bytes());
        let line = format!("ssh-ed25519 {}", STANDARD.encode(&empty_material));
        assert!(matches!(parse_public_key(&line), Err(ControlError::InvalidSpec(_))));
    }

    #[test]
    fn user_crud_and_permissions() {
        let (_dir, store, admin) = setup();
        let alice = create_alice(&store, &admin);
        let as_alice = Actor::user(alice.user_id);

        assert!(matches!(list_users(&store, &as_alice), Err(ControlError::Forbidden(_))));
        assert_eq!(list_users(&store, &admin).unwrap().len(), 2);
        assert_eq!(get_user(&store, &as_alice, alice.user_id).unwrap().username, "alice");
        assert!(get_user(&store, &as_alice, admin.user_id).is_err());

        let updated = update_user(
            &store,
            &as_alice,
            alice.user_id,
            UpdateUserRequest {
                username: Some("alice2".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(updated.username, "alice2");

        // Users can't promote themselves
        let result = update_user(
            &store,
            &as_alice,
            alice.user_id,
            UpdateUserRequest {
                role: Some(Role::Admin),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(ControlError::Forbidden(_))));

        delete_user(&store, &admin, alice.user_id).unwrap();
        assert!(matches!(
            get_user(&store, &admin, alice.user_id),
            Err(ControlError::UserNotFound(_))
        ));
    }

    #[test]
    fn duplicate_email_conflicts() {
        let (_dir, store, admin) = setup();
        create_alice(&store, &admin);
        let result = create_user(
            &store,
            &admin,
            CreateUserRequest {
                username: "other".to_string(),
                email: "ALICE@example.com".to_string(),
                role: Role::User,
            },
        );
        assert!(matches!(result, Err(ControlError::Conflict(_))));
    }

    #[test]
    fn invalid_email_rejected() {
        let (_dir, store, admin) = setup();
        let result = create_user(
            &store,
            &admin,
            CreateUserRequest {
                username: "bob".to_string(),
                email: "bob".to_string(),
                role: Role::User,
            },
        );
        assert!(matches!(result, Err(ControlError::InvalidSpec(_))));
    }

    #[test]
    fn ssh_key_lifecycle() {
        let (_dir, store, admin) = setup();
        let alice = create_alice(&store, &admin);
        let as_alice = Actor::user(alice.user_id);

        let key = create_ssh_key(
            &store,
            &as_alice,
            CreateSshKeyRequest {
                name: "laptop".to_string(),
                public_key: ALICE_KEY.to_string(),
            },
        )
        .unwrap();
        assert_eq!(key.fingerprint, ALICE_FINGERPRINT);
        assert_eq!(list_ssh_keys(&store, &as_alice).unwrap().len(), 1);

        // Same key twice is a conflict
        let dup = create_ssh_key(
            &store,
            &Actor::user(UserId::new(99)),
            CreateSshKeyRequest {
                name: "stolen".to_string(),
                public_key: ALICE_KEY.to_string(),
            },
        );
        assert!(matches!(dup, Err(ControlError::Conflict(_))));

        // Others can't see it
        assert!(matches!(
            get_ssh_key(&store, &Actor::user(UserId::new(99)), &key.key_id),
            Err(ControlError::Forbidden(_))
        ));

        let renamed = update_ssh_key(
            &store,
            &as_alice,
            &key.key_id,
            UpdateSshKeyRequest {
                name: "desktop".to_string(),
            },
        )
        .unwrap();
        assert_eq!(renamed.name, "desktop");

        let auth = authenticate_ssh_key(
            &store,
            &SshAuthRequest {
                public_key: Some(ALICE_KEY.to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(auth.user_id, alice.user_id);
        assert!(store
            .get_ssh_key(&key.key_id)
            .unwrap()
            .unwrap()
            .last_used_at
            .is_some());

        // A user with keys can still be deleted; keys go with them
        delete_user(&store, &admin, alice.user_id).unwrap();
        assert!(store.get_ssh_key(&key.key_id).unwrap().is_none());
    }

    #[test]
    fn unknown_fingerprint_is_not_found() {
        let (_dir, store, _admin) = setup();
        let result = authenticate_ssh_key(
            &store,
            &SshAuthRequest {
                fingerprint: Some(ALICE_FINGERPRINT.to_string()),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(ControlError::SshKeyNotFound(_))));
        assert!(authenticate_ssh_key(&store, &SshAuthRequest::default()).is_err());
    }
}
