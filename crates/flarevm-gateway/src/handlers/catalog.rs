//! System image and VM offer endpoints.
//!
//! Anyone signed in may browse the catalog; changes are admin-only. `GET`
//! accepts an ID or a name (`ubuntu-22.04`, `standard`).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use flarevm_auth::JwtValidator;
use flarevm_control::{
    ControlPlane, CreateImageRequest, CreateOfferRequest, SystemImage, UpdateImageRequest,
    UpdateOfferRequest, VmOffer,
};
use flarevm_core::{ImageId, OfferId};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::GatewayState;

/// Response for image list.
#[derive(Debug, Serialize)]
pub struct ListImagesResponse {
    /// Registered images.
    pub system_images: Vec<SystemImage>,
}

/// Response for offer list.
#[derive(Debug, Serialize)]
pub struct ListOffersResponse {
    /// Offers visible to the caller.
    pub vm_offers: Vec<VmOffer>,
}

// =============================================================================
// System Images
// =============================================================================

/// List system images.
///
/// # Errors
///
/// Returns an error if the control plane operation fails.
pub async fn list_images<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let system_images = state.control.list_images(&user.actor()).await?;
    Ok(Json(ListImagesResponse { system_images }))
}

/// Register a system image (admin).
///
/// # Errors
///
/// Returns an error if the caller is not an admin or the image is invalid.
pub async fn create_image<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
    Json(body): Json<CreateImageRequest>,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let image = state.control.create_image(&user.actor(), body).await?;
    Ok((StatusCode::CREATED, Json(image)))
}

/// Get a system image by ID or reference.
///
/// # Errors
///
/// Returns an error if no image matches.
pub async fn get_image<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
    Path(reference): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let image = state.control.get_image(&user.actor(), &reference).await?;
    Ok(Json(image))
}

/// Update a system image no VM uses (admin).
///
/// # Errors
///
/// Returns an error if the image is not found or still referenced.
pub async fn update_image<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
    Path(image_id): Path<String>,
    Json(body): Json<UpdateImageRequest>,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let image_id: ImageId = parse_id(&image_id, "system image")?;
    let image = state
        .control
        .update_image(&user.actor(), &image_id, body)
        .await?;
    Ok(Json(image))
}

/// Delete a system image no VM uses (admin).
///
/// # Errors
///
/// Returns an error if the image is not found or still referenced.
pub async fn delete_image<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
    Path(image_id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let image_id: ImageId = parse_id(&image_id, "system image")?;
    state.control.delete_image(&user.actor(), &image_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// VM Offers
// =============================================================================

/// List offers. Retired offers are only listed for admins.
///
/// # Errors
///
/// Returns an error if the control plane operation fails.
pub async fn list_offers<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let vm_offers = state.control.list_offers(&user.actor()).await?;
    Ok(Json(ListOffersResponse { vm_offers }))
}

/// Create an offer (admin).
///
/// # Errors
///
/// Returns an error if the caller is not an admin or the offer is invalid.
pub async fn create_offer<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
    Json(body): Json<CreateOfferRequest>,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let offer = state.control.create_offer(&user.actor(), body).await?;
    Ok((StatusCode::CREATED, Json(offer)))
}

/// Get an offer by ID or name.
///
/// # Errors
///
/// Returns an error if no offer matches.
pub async fn get_offer<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
    Path(reference): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let offer = state.control.get_offer(&user.actor(), &reference).await?;
    Ok(Json(offer))
}

/// Update an offer (admin).
///
/// # Errors
///
/// Returns an error if the offer is not found or the update is invalid.
pub async fn update_offer<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
    Path(offer_id): Path<String>,
    Json(body): Json<UpdateOfferRequest>,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let offer_id: OfferId = parse_id(&offer_id, "VM offer")?;
    let offer = state
        .control
        .update_offer(&user.actor(), &offer_id, body)
        .await?;
    Ok(Json(offer))
}

/// Delete an offer no VM uses (admin).
///
/// # Errors
///
/// Returns an error if the offer is not found or still referenced.
pub async fn delete_offer<C, V>(
    State(state): State<Arc<GatewayState<C, V>>>,
    user: AuthUser,
    Path(offer_id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let offer_id: OfferId = parse_id(&offer_id, "VM offer")?;
    state.control.delete_offer(&user.actor(), &offer_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn parse_id<T: std::str::FromStr>(s: &str, what: &str) -> Result<T, ApiError> {
    s.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid {what} ID: {s}")))
}
