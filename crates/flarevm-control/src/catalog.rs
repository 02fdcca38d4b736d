//! System image and VM offer catalog.
//!
//! These functions are called by [`ControlPlaneService`](crate::ControlPlaneService)
//! and take the store directly. Writes are admin only; reads are open to any
//! authenticated caller.

use chrono::Utc;
use flarevm_core::{Actor, ImageId, OfferId};
use flarevm_store::{Store, SystemImage, VmOffer};

use crate::error::{ControlError, Result};
use crate::types::{CreateImageRequest, CreateOfferRequest, UpdateImageRequest, UpdateOfferRequest};

const GIB: u64 = 1024 * 1024 * 1024;

pub(crate) fn require_admin(actor: &Actor, what: &str) -> Result<()> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(ControlError::Forbidden(format!("{what} requires the admin role")))
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(ControlError::InvalidSpec(format!("{field} must not be empty")))
    } else {
        Ok(())
    }
}

/// Map common architecture aliases onto one spelling.
#[must_use]
pub fn normalize_architecture(arch: &str) -> &str {
    match arch {
        "amd64" | "x86-64" | "x64" => "x86_64",
        "arm64" => "aarch64",
        other => other,
    }
}

// =============================================================================
// Images
// =============================================================================

/// Resolve an image by ID, `name-version`, or bare `name`.
///
/// A bare name that matches several versions resolves to the most recently
/// registered one, ties going to the higher version string.
///
/// # Errors
///
/// Returns `ControlError::ImageNotFound` if nothing matches.
pub fn resolve_image<S: Store>(store: &S, reference: &str) -> Result<SystemImage> {
    if let Ok(image_id) = reference.parse::<ImageId>() {
        if let Some(image) = store.get_image(&image_id)? {
            return Ok(image);
        }
    }

    let images = store.list_images()?;
    let exact = images
        .iter()
        .find(|image| format!("{}-{}", image.name, image.version) == reference);
    if let Some(image) = exact {
        return Ok(image.clone());
    }

    images
        .into_iter()
        .filter(|image| image.matches_reference(reference))
        .max_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.version.cmp(&b.version))
        })
        .ok_or_else(|| ControlError::ImageNotFound(reference.to_string()))
}

/// Get an image by ID.
///
/// # Errors
///
/// Returns `ControlError::ImageNotFound` if it doesn't exist.
pub fn get_image<S: Store>(store: &S, image_id: &ImageId) -> Result<SystemImage> {
    store
        .get_image(image_id)?
        .ok_or_else(|| ControlError::ImageNotFound(image_id.to_string()))
}

fn image_in_use<S: Store>(store: &S, image_id: &ImageId) -> Result<bool> {
    Ok(store
        .list_all_vms()?
        .iter()
        .any(|vm| vm.system_image_id == *image_id))
}

fn validate_image(image: &SystemImage) -> Result<()> {
    require_non_empty("name", &image.name)?;
    require_non_empty("version", &image.version)?;
    require_non_empty("architecture", &image.architecture)?;
    require_non_empty("kernel_image_path", &image.kernel_image_path)?;
    require_non_empty("rootfs_path", &image.rootfs_path)?;
    if image.size_bytes == 0 {
        return Err(ControlError::InvalidSpec("size_bytes must be positive".into()));
    }
    Ok(())
}

/// Register a system image.
///
/// # Errors
///
/// Returns `Forbidden` for non-admins, `InvalidSpec` for missing fields and
/// `Conflict` if `(name, version)` is taken.
pub fn create_image<S: Store>(
    store: &S,
    actor: &Actor,
    request: CreateImageRequest,
) -> Result<SystemImage> {
    require_admin(actor, "registering images")?;

    let image = SystemImage {
        image_id: ImageId::generate(),
        name: request.name.trim().to_string(),
        version: request.version.trim().to_string(),
        kernel_version: request.kernel_version,
        architecture: normalize_architecture(request.architecture.trim()).to_string(),
        checksum: request.checksum,
        size_bytes: request.size_bytes,
        kernel_image_path: request.kernel_image_path,
        rootfs_path: request.rootfs_path,
        created_at: Utc::now(),
    };
    validate_image(&image)?;
    store.put_image(&image)?;

    tracing::info!(
        image_id = %image.image_id,
        name = %image.name,
        version = %image.version,
        "Registered image"
    );
    Ok(image)
}

/// Update a system image that no VM references.
///
/// # Errors
///
/// Returns `Forbidden` for non-admins, `ImageNotFound`, and `Conflict` if a
/// VM was provisioned from the image.
pub fn update_image<S: Store>(
    store: &S,
    actor: &Actor,
    image_id: &ImageId,
    request: UpdateImageRequest,
) -> Result<SystemImage> {
    require_admin(actor, "updating images")?;

    let mut image = get_image(store, image_id)?;
    if image_in_use(store, image_id)? {
        return Err(ControlError::Conflict(format!(
            "image {image_id} is in use by existing VMs"
        )));
    }

    if let Some(name) = request.name {
        image.name = name.trim().to_string();
    }
    if let Some(version) = request.version {
        image.version = version.trim().to_string();
    }
    if let Some(kernel_version) = request.kernel_version {
        image.kernel_version = kernel_version;
    }
    if let Some(architecture) = request.architecture {
        image.architecture = normalize_architecture(architecture.trim()).to_string();
    }
    if let Some(checksum) = request.checksum {
        image.checksum = checksum;
    }
    if let Some(size_bytes) = request.size_bytes {
        image.size_bytes = size_bytes;
    }
    if let Some(path) = request.kernel_image_path {
        image.kernel_image_path = path;
    }
    if let Some(path) = request.rootfs_path {
        image.rootfs_path = path;
    }

    validate_image(&image)?;
    store.put_image(&image)?;

    tracing::info!(image_id = %image_id, "Updated image");
    Ok(image)
}

/// Delete a system image that no VM references.
///
/// # Errors
///
/// Returns `Forbidden` for non-admins, `ImageNotFound`, and `Conflict` if a
/// VM was provisioned from the image.
pub fn delete_image<S: Store>(store: &S, actor: &Actor, image_id: &ImageId) -> Result<()> {
    require_admin(actor, "deleting images")?;

    get_image(store, image_id)?;
    if image_in_use(store, image_id)? {
        return Err(ControlError::Conflict(format!(
            "image {image_id} is in use by existing VMs"
        )));
    }
    store.delete_image(image_id)?;

    tracing::info!(image_id = %image_id, "Deleted image");
    Ok(())
}

// =============================================================================
// Offers
// =============================================================================

/// Resolve an offer by ID or name.
///
/// # Errors
///
/// Returns `ControlError::OfferNotFound` if nothing matches.
pub fn resolve_offer<S: Store>(store: &S, reference: &str) -> Result<VmOffer> {
    if let Ok(offer_id) = reference.parse::<OfferId>() {
        if let Some(offer) = store.get_offer(&offer_id)? {
            return Ok(offer);
        }
    }

    store
        .list_offers()?
        .into_iter()
        .find(|offer| offer.name == reference)
        .ok_or_else(|| ControlError::OfferNotFound(reference.to_string()))
}

/// Get an offer by ID.
///
/// # Errors
///
/// Returns `ControlError::OfferNotFound` if it doesn't exist.
pub fn get_offer<S: Store>(store: &S, offer_id: &OfferId) -> Result<VmOffer> {
    store
        .get_offer(offer_id)?
        .ok_or_else(|| ControlError::OfferNotFound(offer_id.to_string()))
}

fn validate_offer(offer: &VmOffer) -> Result<()> {
    require_non_empty("name", &offer.name)?;
    if offer.vcpu_count == 0 || offer.memory_size_mib == 0 || offer.disk_size_gb == 0 {
        return Err(ControlError::InvalidSpec(
            "vcpu_count, memory_size_mib and disk_size_gb must be positive".into(),
        ));
    }
    if !offer.price_per_hour.is_finite() || offer.price_per_hour < 0.0 {
        return Err(ControlError::InvalidSpec(
            "price_per_hour must be a non-negative number".into(),
        ));
    }
    Ok(())
}

/// Create a VM offer.
///
/// # Errors
///
/// Returns `Forbidden` for non-admins, `InvalidSpec` for bad resources and
/// `Conflict` if the name is taken.
pub fn create_offer<S: Store>(
    store: &S,
    actor: &Actor,
    request: CreateOfferRequest,
) -> Result<VmOffer> {
    require_admin(actor, "creating offers")?;

    let now = Utc::now();
    let offer = VmOffer {
        offer_id: OfferId::generate(),
        name: request.name.trim().to_string(),
        description: request.description,
        vcpu_count: request.vcpu_count,
        memory_size_mib: request.memory_size_mib,
        disk_size_gb: request.disk_size_gb,
        price_per_hour: request.price_per_hour,
        is_active: request.is_active,
        created_at: now,
        updated_at: now,
    };
    validate_offer(&offer)?;
    store.put_offer(&offer)?;

    tracing::info!(offer_id = %offer.offer_id, name = %offer.name, "Created offer");
    Ok(offer)
}

/// Update a VM offer.
///
/// Existing VMs keep the resources they were created with.
///
/// # Errors
///
/// Returns `Forbidden` for non-admins, `OfferNotFound`, `InvalidSpec` and
/// `Conflict` if the new name is taken.
pub fn update_offer<S: Store>(
    store: &S,
    actor: &Actor,
    offer_id: &OfferId,
    request: UpdateOfferRequest,
) -> Result<VmOffer> {
    require_admin(actor, "updating offers")?;

    let mut offer = get_offer(store, offer_id)?;
    if let Some(name) = request.name {
        offer.name = name.trim().to_string();
    }
    if let Some(description) = request.description {
        offer.description = description;
    }
    if let Some(vcpu_count) = request.vcpu_count {
        offer.vcpu_count = vcpu_count;
    }
    if let Some(memory) = request.memory_size_mib {
        offer.memory_size_mib = memory;
    }
    if let Some(disk) = request.disk_size_gb {
        offer.disk_size_gb = disk;
    }
    if let Some(price) = request.price_per_hour {
        offer.price_per_hour = price;
    }
    if let Some(is_active) = request.is_active {
        offer.is_active = is_active;
    }
    offer.updated_at = Utc::now();

    validate_offer(&offer)?;
    store.put_offer(&offer)?;

    tracing::info!(offer_id = %offer_id, is_active = offer.is_active, "Updated offer");
    Ok(offer)
}

/// Delete a VM offer that no VM references.
///
/// # Errors
///
/// Returns `Forbidden` for non-admins, `OfferNotFound`, and `Conflict` if a
/// VM uses the offer.
pub fn delete_offer<S: Store>(store: &S, actor: &Actor, offer_id: &OfferId) -> Result<()> {
    require_admin(actor, "deleting offers")?;

    get_offer(store, offer_id)?;
    if store
        .list_all_vms()?
        .iter()
        .any(|vm| vm.vm_offer_id == *offer_id)
    {
        return Err(ControlError::Conflict(format!(
            "offer {offer_id} is in use by existing VMs; deactivate it instead"
        )));
    }
    store.delete_offer(offer_id)?;

    tracing::info!(offer_id = %offer_id, "Deleted offer");
    Ok(())
}

// =============================================================================
// Compatibility
// =============================================================================

/// Check that a VM on `offer` can run `image` on this host.
///
/// # Errors
///
/// Returns `ControlError::InvalidSpec` if the offer is retired, the
/// architecture differs from the host, or the image doesn't fit the disk.
pub fn check_compatibility(
    image: &SystemImage,
    offer: &VmOffer,
    host_architecture: &str,
) -> Result<()> {
    if !offer.is_active {
        return Err(ControlError::InvalidSpec(format!(
            "offer {} is not active",
            offer.name
        )));
    }

    let image_arch = normalize_architecture(&image.architecture);
    let host_arch = normalize_architecture(host_architecture);
    if image_arch != host_arch {
        return Err(ControlError::InvalidSpec(format!(
            "image {}-{} is built for {image_arch}, host is {host_arch}",
            image.name, image.version
        )));
    }

    let disk_bytes = u64::from(offer.disk_size_gb) * GIB;
    if image.size_bytes > disk_bytes {
        return Err(ControlError::InvalidSpec(format!(
            "image {}-{} needs {} bytes, offer {} has a {} GB disk",
            image.name, image.version, image.size_bytes, offer.name, offer.disk_size_gb
        )));
    }

    Ok(())
}
