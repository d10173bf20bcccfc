use axum::extract::Path;
use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::{Deserialize, Serialize};

use super::{auth_fields, Json};
use crate::{
    service::dms::{DmsSwitch, SweepOutcome, SwitchStatus},
    services, Error, ErrorKind, Result,
};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBody {
    pub recipient_username: String,
    pub encrypted_message: String,
    pub check_in_interval_hours: u32,
    pub sender_pubkey: String,
    pub signature: Option<String>,
    pub timestamp: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResponse {
    pub success: bool,
    pub switch_id: String,
    pub next_deadline: DateTime<Utc>,
}

/// # `POST /api/dms/create`
///
/// Registers a switch: a pre-encrypted message released to the recipient
/// if the sender stops checking in.
pub async fn create_route(Json(body): Json<CreateBody>) -> Result<Json<CreateResponse>> {
    let (signature, timestamp) = auth_fields(&body.signature, body.timestamp)?;
    services().verifier.verify(
        &body.sender_pubkey,
        signature,
        timestamp,
        "dms:create",
        &[&body.recipient_username],
    )?;

    let switch = services()
        .dms
        .create(
            &body.sender_pubkey,
            &body.recipient_username,
            &body.encrypted_message,
            body.check_in_interval_hours,
        )
        .await?;

    Ok(Json(CreateResponse {
        success: true,
        switch_id: switch.switch_id,
        next_deadline: switch.next_deadline,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckinBody {
    pub sender_pubkey: String,
    pub signature: Option<String>,
    pub timestamp: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckinResponse {
    pub success: bool,
    pub checked_in: bool,
    pub switch_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_deadline: Option<DateTime<Utc>>,
}

/// # `POST /api/dms/checkin`
///
/// Proof of liveness: every active switch owned by the signer gets its
/// deadline pushed out by its own interval.
pub async fn checkin_route(Json(body): Json<CheckinBody>) -> Result<Json<CheckinResponse>> {
    let (signature, timestamp) = auth_fields(&body.signature, body.timestamp)?;
    services()
        .verifier
        .verify(&body.sender_pubkey, signature, timestamp, "dms:checkin", &[])?;

    let (switch_count, next_deadline) = services().dms.check_in(&body.sender_pubkey)?;

    Ok(Json(CheckinResponse {
        success: true,
        checked_in: true,
        switch_count,
        next_deadline,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchMetadata {
    pub switch_id: String,
    pub recipient_username: String,
    pub interval_hours: u32,
    pub next_deadline: DateTime<Utc>,
    pub status: SwitchStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggered_at: Option<DateTime<Utc>>,
}

impl From<DmsSwitch> for SwitchMetadata {
    fn from(switch: DmsSwitch) -> Self {
        Self {
            switch_id: switch.switch_id,
            recipient_username: switch.recipient_username,
            interval_hours: switch.interval_hours,
            next_deadline: switch.next_deadline,
            status: switch.status,
            created_at: switch.created_at,
            triggered_at: switch.triggered_at,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    pub switches: Vec<SwitchMetadata>,
}

/// # `GET /api/dms/list/{pubkey}`
///
/// The owner's switches, metadata only. Ciphertexts are never listed.
pub async fn list_route(Path(pubkey): Path<String>) -> Result<Json<ListResponse>> {
    let switches = services()
        .dms
        .list(&pubkey)?
        .into_iter()
        .map(SwitchMetadata::from)
        .collect();

    Ok(Json(ListResponse { switches }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelBody {
    pub sender_pubkey: String,
    pub signature: Option<String>,
    pub timestamp: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub success: bool,
}

/// # `DELETE /api/dms/{switch_id}`
///
/// Cancels a switch. The switch id is bound into the signed challenge.
pub async fn cancel_route(
    Path(switch_id): Path<String>,
    Json(body): Json<CancelBody>,
) -> Result<Json<CancelResponse>> {
    let (signature, timestamp) = auth_fields(&body.signature, body.timestamp)?;
    services().verifier.verify(
        &body.sender_pubkey,
        signature,
        timestamp,
        "dms:cancel",
        &[&switch_id],
    )?;

    services().dms.cancel(&body.sender_pubkey, &switch_id)?;

    Ok(Json(CancelResponse { success: true }))
}

/// # `POST /api/dms/process`
///
/// The periodic sweep, driven by an external scheduler. Authenticated with
/// the shared `X-Cron-Secret` header instead of a signature, because no
/// user owns this call.
pub async fn process_route(headers: HeaderMap) -> Result<Json<SweepOutcome>> {
    let presented = headers
        .get("x-cron-secret")
        .and_then(|value| value.to_str().ok())
        .ok_or(Error::BadRequest(
            ErrorKind::AuthMissing,
            "Missing cron secret",
        ))?;

    if !services().globals.cron_secret_matches(presented) {
        return Err(Error::BadRequest(
            ErrorKind::AuthInvalid,
            "Invalid cron secret",
        ));
    }

    Ok(Json(services().dms.process_due().await?))
}
