use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::error::{ApiError, ApiResult};
use super::state::ApiState;
use crate::extraction::text::document_text;
use crate::models::{Invoice, MediaType, SubmitRequest};
use crate::templates::learn_template;

/// Accept an uploaded file for processing. Quota and input checks happen before anything is queued.
pub async fn submit_job(body: web::Json<SubmitRequest>, state: web::Data<ApiState>) -> ApiResult<HttpResponse> {
    let request = body.into_inner();
    if state.submit_limiter.check_key(&request.owner_id).is_err() {
        return Err(ApiError::too_many_requests("Rate limit exceeded").with_details(json!({ "retry_after": 60 })));
    }

    let receipt = state.pipeline.submit(request).await?;
    Ok(HttpResponse::Accepted().json(json!({
        "job_id": receipt.job_id,
        "invoice_id": receipt.invoice_id,
        "status": "queued",
        "status_url": format!("/api/v1/jobs/{}", receipt.job_id),
    })))
}

pub async fn get_status(path: web::Path<Uuid>, state: web::Data<ApiState>) -> ApiResult<HttpResponse> {
    let status = state.pipeline.get_status(path.into_inner())?;
    Ok(HttpResponse::Ok().json(status))
}

pub async fn retry_job(path: web::Path<Uuid>, state: web::Data<ApiState>) -> ApiResult<HttpResponse> {
    let status = state.pipeline.retry(path.into_inner()).await?;
    Ok(HttpResponse::Accepted().json(status))
}

pub async fn cancel_job(path: web::Path<Uuid>, state: web::Data<ApiState>) -> ApiResult<HttpResponse> {
    let status = state.pipeline.cancel(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(status))
}

pub async fn job_stats(state: web::Data<ApiState>) -> HttpResponse {
    HttpResponse::Ok().json(state.pipeline.stats())
}

pub async fn owner_quota(path: web::Path<Uuid>, state: web::Data<ApiState>) -> ApiResult<HttpResponse> {
    let usage = state.pipeline.quota_usage(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(usage))
}

pub async fn validate_invoice(body: web::Json<Invoice>, state: web::Data<ApiState>) -> HttpResponse {
    let result = state.validator.validate(&body).await;
    HttpResponse::Ok().json(result)
}

/// Validate, apply the confident suggestions, and report the result for the corrected invoice.
pub async fn auto_fix_invoice(body: web::Json<Invoice>, state: web::Data<ApiState>) -> HttpResponse {
    let before = state.validator.validate(&body).await;
    let outcome = state.validator.auto_fix(&body, &before);
    let after = state.validator.validate(&outcome.invoice).await;

    HttpResponse::Ok().json(json!({
        "invoice": outcome.invoice,
        "applied": outcome.applied,
        "validation": after,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LearnTemplateRequest {
    pub name: Option<String>,
}

/// Learn a template from a reviewed invoice and the text of its source document.
pub async fn learn_invoice_template(
    path: web::Path<Uuid>,
    body: Option<web::Json<LearnTemplateRequest>>,
    state: web::Data<ApiState>,
) -> ApiResult<HttpResponse> {
    let matcher = state
        .templates
        .clone()
        .ok_or_else(|| ApiError::conflict("template matching is disabled"))?;
    let invoice_id = path.into_inner();
    let deps = state.pipeline.deps();

    let record = deps.records.get_invoice(invoice_id).await?;
    let key = record
        .source_document_key
        .clone()
        .ok_or_else(|| ApiError::conflict(format!("invoice {} has no source document", invoice_id)))?;
    let media = MediaType::from_file_name(&key)
        .ok_or_else(|| ApiError::bad_request(format!("cannot determine media type of {}", key)))?;
    let bytes = deps.blobs.get(&key).await?;

    let text = web::block(move || document_text(&bytes, media))
        .await
        .map_err(|e| ApiError::internal_server_error(e.to_string()))?
        .ok_or_else(|| ApiError::bad_request("source document has no text layer"))?;

    let name = body
        .and_then(|b| b.into_inner().name)
        .or_else(|| record.invoice.vendor.name.clone())
        .unwrap_or_else(|| format!("invoice-{}", invoice_id));
    let template = learn_template(&name, &record.invoice.to_fields(), &text)
        .ok_or_else(|| ApiError::bad_request("no field value could be anchored to a label"))?;

    matcher.add(template.clone()).await?;
    info!(template_id = %template.id, patterns = template.patterns.len(), "template learned");
    Ok(HttpResponse::Created().json(template))
}

pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "healthy" }))
}

pub async fn metrics_endpoint() -> ApiResult<HttpResponse> {
    use prometheus::{Encoder, TextEncoder};

    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| ApiError::internal_server_error(e.to_string()))?;

    Ok(HttpResponse::Ok().content_type("text/plain; version=0.0.4").body(buffer))
}
