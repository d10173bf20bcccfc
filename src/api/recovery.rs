use axum::extract::Path;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{auth_fields, Json};
use crate::{
    service::recovery::{GuardianUpload, SessionStatus},
    services, Error, ErrorKind, Result,
};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributeBody {
    pub sender_pubkey: String,
    pub threshold: u32,
    pub guardians: Vec<GuardianUpload>,
    pub signature: Option<String>,
    pub timestamp: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributeResponse {
    pub success: bool,
    pub guardian_count: usize,
    pub threshold: u32,
}

/// # `POST /api/recovery/distribute`
///
/// Replaces the owner's k-of-n setup: one encrypted share per guardian plus
/// the threshold needed to reassemble them.
pub async fn distribute_route(
    Json(body): Json<DistributeBody>,
) -> Result<Json<DistributeResponse>> {
    let (signature, timestamp) = auth_fields(&body.signature, body.timestamp)?;
    services().verifier.verify(
        &body.sender_pubkey,
        signature,
        timestamp,
        "recovery:distribute",
        &[],
    )?;

    let config = services()
        .recovery
        .distribute(&body.sender_pubkey, body.threshold, &body.guardians)?;

    Ok(Json(DistributeResponse {
        success: true,
        guardian_count: config.guardians.len(),
        threshold: config.threshold,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardiansResponse {
    pub configured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guardians: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// # `GET /api/recovery/guardians/{pubkey}`
///
/// The owner's public guardian set. Unauthenticated: the set itself is not
/// a secret, only the shares are.
pub async fn guardians_route(Path(pubkey): Path<String>) -> Result<Json<GuardiansResponse>> {
    let response = match services().recovery.config(&pubkey)? {
        Some(config) => GuardiansResponse {
            configured: true,
            guardians: Some(config.guardians),
            threshold: Some(config.threshold),
            created_at: Some(config.created_at),
        },
        None => GuardiansResponse {
            configured: false,
            guardians: None,
            threshold: None,
            created_at: None,
        },
    };

    Ok(Json(response))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardianshipsResponse {
    pub guardianships: Vec<String>,
}

/// # `GET /api/recovery/guardianships/{pubkey}`
///
/// Every owner this pubkey holds a share for.
pub async fn guardianships_route(
    Path(pubkey): Path<String>,
) -> Result<Json<GuardianshipsResponse>> {
    Ok(Json(GuardianshipsResponse {
        guardianships: services().recovery.guardianships(&pubkey)?,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBody {
    pub owner_pubkey: String,
    pub ephemeral_pubkey: String,
    pub requested_guardians: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestResponse {
    pub success: bool,
    pub session_id: String,
    pub threshold: u32,
    pub expires_in: &'static str,
}

/// # `POST /api/recovery/request`
///
/// Opens an approval session. Unauthenticated by design: the requester has
/// lost every key they could have signed with.
pub async fn create_session_route(
    Json(body): Json<RequestBody>,
) -> Result<Json<RequestResponse>> {
    let session = services().recovery.create_session(
        &body.owner_pubkey,
        &body.ephemeral_pubkey,
        body.requested_guardians,
    )?;

    Ok(Json(RequestResponse {
        success: true,
        session_id: session.session_id,
        threshold: session.threshold,
        expires_in: "24h",
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusResponse {
    pub session_id: String,
    pub status: SessionStatus,
    pub approvals_received: u32,
    pub threshold_required: u32,
    pub owner_pubkey: String,
    pub created_at: DateTime<Utc>,
}

/// # `GET /api/recovery/session/{session_id}/status`
///
/// Pollable session state. The unguessable session id is the only guard.
pub async fn session_status_route(
    Path(session_id): Path<String>,
) -> Result<Json<SessionStatusResponse>> {
    let session = services()
        .recovery
        .session(&session_id)?
        .ok_or(Error::BadRequest(
            ErrorKind::NotFound,
            "Recovery session not found or expired",
        ))?;

    Ok(Json(SessionStatusResponse {
        session_id: session.session_id,
        status: session.status,
        approvals_received: session.approvals,
        threshold_required: session.threshold,
        owner_pubkey: session.owner_pubkey,
        created_at: session.created_at,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveBody {
    pub guardian_pubkey: String,
    pub re_encrypted_share: String,
    pub signature: Option<String>,
    pub timestamp: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveResponse {
    pub approved: bool,
    pub approvals_received: u32,
    pub threshold_required: u32,
}

/// # `POST /api/recovery/session/{session_id}/approve`
///
/// A guardian hands in their share, re-encrypted to the session's
/// ephemeral key. The session id is bound into the signed challenge.
pub async fn approve_route(
    Path(session_id): Path<String>,
    Json(body): Json<ApproveBody>,
) -> Result<Json<ApproveResponse>> {
    let (signature, timestamp) = auth_fields(&body.signature, body.timestamp)?;
    services().verifier.verify(
        &body.guardian_pubkey,
        signature,
        timestamp,
        "recovery:approve",
        &[&session_id],
    )?;

    let session =
        services()
            .recovery
            .approve(&session_id, &body.guardian_pubkey, &body.re_encrypted_share)?;

    Ok(Json(ApproveResponse {
        approved: true,
        approvals_received: session.approvals,
        threshold_required: session.threshold,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionShare {
    pub guardian_pubkey: String,
    pub re_encrypted_share: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SharesResponse {
    pub shares: Vec<SessionShare>,
}

/// # `GET /api/recovery/session/{session_id}/shares`
///
/// The collected shares, once the threshold was met. Unauthenticated by
/// design: each share is sealed to the requester's ephemeral key, so
/// possession of the response is useless to anyone else.
pub async fn session_shares_route(
    Path(session_id): Path<String>,
) -> Result<Json<SharesResponse>> {
    let shares = services()
        .recovery
        .released_shares(&session_id)?
        .into_iter()
        .map(|(guardian_pubkey, re_encrypted_share)| SessionShare {
            guardian_pubkey,
            re_encrypted_share,
        })
        .collect();

    Ok(Json(SharesResponse { shares }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeBody {
    pub sender_pubkey: String,
    pub signature: Option<String>,
    pub timestamp: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeResponse {
    pub success: bool,
}

/// # `DELETE /api/recovery/revoke`
///
/// Removes the owner's config and every guardian share. Idempotent.
pub async fn revoke_route(Json(body): Json<RevokeBody>) -> Result<Json<RevokeResponse>> {
    let (signature, timestamp) = auth_fields(&body.signature, body.timestamp)?;
    services().verifier.verify(
        &body.sender_pubkey,
        signature,
        timestamp,
        "recovery:revoke",
        &[],
    )?;

    services().recovery.revoke(&body.sender_pubkey)?;

    Ok(Json(RevokeResponse { success: true }))
}
