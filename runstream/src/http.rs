//! axum routes over a [`RunService`].
//!
//! Streaming endpoints speak server-sent events framed as
//! `id: <seq>\nevent: <mode>\ndata: <json>\n\n` with `: heartbeat\n\n`
//! keep-alives. Wait endpoints answer `application/json` and hold the
//! connection open with single newline bytes, which JSON parsers skip as
//! leading whitespace.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::error;

use crate::cancel::{CancelAction, CancelRequest};
use crate::cron::CronCreate;
use crate::error::RunError;
use crate::join::{JoinFrame, JoinOptions, RunEventStream, WaitFrame, WaitStream};
use crate::run::{parse_id, CronId, Run, RunCreate, RunId, RunStatus, RunSubmission, ThreadId};
use crate::service::RunService;
use crate::store::CronQuery;

pub const LAST_EVENT_ID: &str = "last-event-id";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<RunService>,
}

impl AppState {
    pub fn new(service: Arc<RunService>) -> Self {
        Self { service }
    }
}

impl IntoResponse for RunError {
    fn into_response(self) -> Response {
        let code = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if code.is_server_error() {
            error!(error = %self, "Request failed");
        }
        (code, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .route("/threads", post(create_thread))
        .route("/threads/:thread_id", get(get_thread))
        .route("/threads/:thread_id/runs", post(create_run).get(search_runs))
        .route("/threads/:thread_id/runs/stream", post(create_run_stream))
        .route("/threads/:thread_id/runs/wait", post(create_run_wait))
        .route("/threads/:thread_id/runs/crons", post(create_thread_cron))
        .route(
            "/threads/:thread_id/runs/:run_id",
            get(get_run).delete(delete_run),
        )
        .route("/threads/:thread_id/runs/:run_id/join", get(join_run))
        .route("/threads/:thread_id/runs/:run_id/stream", get(join_run_stream))
        .route("/threads/:thread_id/runs/:run_id/cancel", post(cancel_run))
        .route("/runs", post(create_stateless_run))
        .route("/runs/stream", post(create_stateless_run_stream))
        .route("/runs/wait", post(create_stateless_run_wait))
        .route("/runs/batch", post(create_batch))
        .route("/runs/cancel", post(cancel_runs))
        .route("/runs/crons", post(create_cron))
        .route("/runs/crons/search", post(search_crons))
        .route("/runs/crons/count", post(count_crons))
        .route("/runs/crons/:cron_id", delete(delete_cron));

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(metrics));

    router.with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

#[cfg(feature = "metrics")]
async fn metrics() -> Response {
    match crate::metrics::gather_metrics() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(err) => RunError::Internal(err.to_string()).into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ThreadCreateBody {
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    metadata: Map<String, Value>,
}

async fn create_thread(
    State(st): State<AppState>,
    Json(body): Json<ThreadCreateBody>,
) -> Result<impl IntoResponse, RunError> {
    let thread_id = body.thread_id.as_deref().map(parse_id::<ThreadId>).transpose()?;
    let thread = st.service.create_thread(thread_id, body.metadata).await?;
    Ok(Json(thread))
}

async fn get_thread(
    State(st): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<impl IntoResponse, RunError> {
    let thread = st.service.get_thread(parse_id(&thread_id)?).await?;
    Ok(Json(thread))
}

/// Run creation payload plus an optional client-chosen run id.
#[derive(Debug, Deserialize)]
struct RunCreateBody {
    #[serde(default)]
    run_id: Option<String>,
    #[serde(flatten)]
    payload: RunCreate,
}

impl RunCreateBody {
    fn into_submission(self, thread_id: Option<ThreadId>) -> Result<RunSubmission, RunError> {
        let submission = match thread_id {
            Some(thread_id) => RunSubmission::stateful(thread_id, self.payload),
            None => RunSubmission::stateless(self.payload),
        };
        let submission = submission.with_request_started_at(Utc::now());
        Ok(match self.run_id.as_deref().map(parse_id::<RunId>).transpose()? {
            Some(run_id) => submission.with_run_id(run_id),
            None => submission,
        })
    }
}

fn run_location(run: &Run) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let location = format!("/threads/{}/runs/{}", run.thread_id, run.run_id);
    if let Ok(value) = HeaderValue::from_str(&location) {
        headers.insert(header::CONTENT_LOCATION, value);
    }
    headers
}

async fn create_run(
    State(st): State<AppState>,
    Path(thread_id): Path<String>,
    Json(body): Json<RunCreateBody>,
) -> Result<Response, RunError> {
    let submission = body.into_submission(Some(parse_id(&thread_id)?))?;
    let run = st.service.create_run(submission).await?;
    Ok((run_location(&run), Json(run)).into_response())
}

async fn create_stateless_run(
    State(st): State<AppState>,
    Json(body): Json<RunCreateBody>,
) -> Result<Response, RunError> {
    let run = st.service.create_run(body.into_submission(None)?).await?;
    Ok((run_location(&run), Json(run)).into_response())
}

async fn create_run_stream(
    State(st): State<AppState>,
    Path(thread_id): Path<String>,
    Json(body): Json<RunCreateBody>,
) -> Result<Response, RunError> {
    let submission = body.into_submission(Some(parse_id(&thread_id)?))?;
    let (run, stream) = st.service.stream_run(submission, JoinOptions::default()).await?;
    Ok(sse_response(&run, stream))
}

async fn create_stateless_run_stream(
    State(st): State<AppState>,
    Json(body): Json<RunCreateBody>,
) -> Result<Response, RunError> {
    let (run, stream) = st
        .service
        .stream_run(body.into_submission(None)?, JoinOptions::default())
        .await?;
    Ok(sse_response(&run, stream))
}

async fn create_run_wait(
    State(st): State<AppState>,
    Path(thread_id): Path<String>,
    Json(body): Json<RunCreateBody>,
) -> Result<Response, RunError> {
    let submission = body.into_submission(Some(parse_id(&thread_id)?))?;
    let (run, stream) = st.service.wait_run(submission).await?;
    Ok(wait_response(&run, stream))
}

async fn create_stateless_run_wait(
    State(st): State<AppState>,
    Json(body): Json<RunCreateBody>,
) -> Result<Response, RunError> {
    let (run, stream) = st.service.wait_run(body.into_submission(None)?).await?;
    Ok(wait_response(&run, stream))
}

/// One batch entry; `thread_id` makes it stateful.
#[derive(Debug, Deserialize)]
struct BatchItem {
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(flatten)]
    body: RunCreateBody,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum BatchSlot {
    Run(Box<Run>),
    Failed { error: String, status: u16 },
}

async fn create_batch(
    State(st): State<AppState>,
    Json(items): Json<Vec<BatchItem>>,
) -> Result<impl IntoResponse, RunError> {
    // Malformed ids fail the whole request before any slot is created.
    let submissions = items
        .into_iter()
        .map(|item| {
            let thread_id = item.thread_id.as_deref().map(parse_id::<ThreadId>).transpose()?;
            item.body.into_submission(thread_id)
        })
        .collect::<Result<Vec<_>, RunError>>()?;

    let outcome = st.service.submit_batch(submissions).await;
    let slots: Vec<BatchSlot> = outcome
        .results
        .into_iter()
        .map(|result| match result {
            Ok(run) => BatchSlot::Run(Box::new(run)),
            Err(err) => BatchSlot::Failed {
                status: err.status_code(),
                error: err.to_string(),
            },
        })
        .collect();
    Ok(Json(slots))
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default = "default_search_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    status: Option<String>,
}

fn default_search_limit() -> usize {
    10
}

async fn search_runs(
    State(st): State<AppState>,
    Path(thread_id): Path<String>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, RunError> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<RunStatus>)
        .transpose()?;
    let runs = st
        .service
        .search_runs(parse_id(&thread_id)?, status, params.limit, params.offset)
        .await?;
    Ok(Json(runs))
}

fn parse_run_path(thread_id: &str, run_id: &str) -> Result<(ThreadId, RunId), RunError> {
    Ok((parse_id(thread_id)?, parse_id(run_id)?))
}

async fn get_run(
    State(st): State<AppState>,
    Path((thread_id, run_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, RunError> {
    let (thread_id, run_id) = parse_run_path(&thread_id, &run_id)?;
    Ok(Json(st.service.get_run(thread_id, run_id).await?))
}

async fn delete_run(
    State(st): State<AppState>,
    Path((thread_id, run_id)): Path<(String, String)>,
) -> Result<StatusCode, RunError> {
    let (thread_id, run_id) = parse_run_path(&thread_id, &run_id)?;
    st.service.delete_run(thread_id, run_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn join_run(
    State(st): State<AppState>,
    Path((thread_id, run_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, RunError> {
    let (thread_id, run_id) = parse_run_path(&thread_id, &run_id)?;
    Ok(Json(st.service.join(thread_id, run_id).await?))
}

/// Query-string boolean: accepts `true`/`yes`/`1` and `false`/`no`/`0`.
fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" | "" => Ok(false),
        other => Err(serde::de::Error::custom(format!("invalid flag value `{other}`"))),
    }
}

#[derive(Debug, Default, Deserialize)]
struct JoinStreamParams {
    #[serde(default, deserialize_with = "deserialize_flag")]
    cancel_on_disconnect: bool,
    /// Comma-separated list of modes to relay.
    #[serde(default)]
    stream_mode: Option<String>,
}

async fn join_run_stream(
    State(st): State<AppState>,
    Path((thread_id, run_id)): Path<(String, String)>,
    Query(params): Query<JoinStreamParams>,
    headers: HeaderMap,
) -> Result<Response, RunError> {
    let (thread_id, run_id) = parse_run_path(&thread_id, &run_id)?;
    let mut options = JoinOptions::default().with_cancel_on_disconnect(params.cancel_on_disconnect);
    if let Some(seq) = last_event_id(&headers)? {
        options = options.with_last_event_id(seq);
    }
    if let Some(modes) = params.stream_mode.as_deref() {
        options = options.with_stream_modes(
            modes
                .split(',')
                .map(str::trim)
                .filter(|mode| !mode.is_empty())
                .map(Into::into)
                .collect(),
        );
    }
    let stream = st.service.join_stream(thread_id, run_id, options).await?;
    let run = st.service.get_run(thread_id, run_id).await;
    let mut response = sse_body(stream);
    if let Ok(run) = run {
        response.headers_mut().extend(run_location(&run));
    }
    Ok(response)
}

fn last_event_id(headers: &HeaderMap) -> Result<Option<u64>, RunError> {
    let Some(value) = headers.get(LAST_EVENT_ID) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| RunError::InvalidArgument("Last-Event-ID must be a sequence number".into()))
}

#[derive(Debug, Default, Deserialize)]
struct CancelParams {
    #[serde(default, deserialize_with = "deserialize_flag")]
    wait: bool,
    #[serde(default)]
    action: Option<String>,
}

impl CancelParams {
    fn action(&self) -> Result<CancelAction, RunError> {
        self.action
            .as_deref()
            .map_or(Ok(CancelAction::default()), str::parse)
    }
}

async fn cancel_run(
    State(st): State<AppState>,
    Path((thread_id, run_id)): Path<(String, String)>,
    Query(params): Query<CancelParams>,
) -> Result<StatusCode, RunError> {
    let (thread_id, run_id) = parse_run_path(&thread_id, &run_id)?;
    st.service
        .cancel_run(thread_id, run_id, params.action()?, params.wait)
        .await?;
    Ok(if params.wait {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::ACCEPTED
    })
}

#[derive(Debug, Default, Deserialize)]
struct CancelRunsBody {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    run_ids: Option<Vec<String>>,
}

async fn cancel_runs(
    State(st): State<AppState>,
    Query(params): Query<CancelParams>,
    Json(body): Json<CancelRunsBody>,
) -> Result<StatusCode, RunError> {
    let thread_id = body.thread_id.as_deref().map(parse_id::<ThreadId>).transpose()?;
    let run_ids = body
        .run_ids
        .map(|ids| ids.iter().map(|id| parse_id::<RunId>(id)).collect::<Result<Vec<_>, _>>())
        .transpose()?;
    let request = CancelRequest::from_parts(body.status.as_deref(), thread_id, run_ids, params.action()?)?;
    st.service.cancel(request, params.wait).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_cron(
    State(st): State<AppState>,
    Json(body): Json<CronCreate>,
) -> Result<impl IntoResponse, RunError> {
    Ok(Json(st.service.create_cron(None, body).await?))
}

async fn create_thread_cron(
    State(st): State<AppState>,
    Path(thread_id): Path<String>,
    Json(body): Json<CronCreate>,
) -> Result<impl IntoResponse, RunError> {
    let thread_id = parse_id::<ThreadId>(&thread_id)?;
    Ok(Json(st.service.create_cron(Some(thread_id), body).await?))
}

async fn search_crons(
    State(st): State<AppState>,
    Json(query): Json<CronQuery>,
) -> Result<impl IntoResponse, RunError> {
    Ok(Json(st.service.search_crons(&query).await?))
}

async fn count_crons(
    State(st): State<AppState>,
    Json(query): Json<CronQuery>,
) -> Result<impl IntoResponse, RunError> {
    Ok(Json(st.service.count_crons(&query).await?))
}

async fn delete_cron(
    State(st): State<AppState>,
    Path(cron_id): Path<String>,
) -> Result<StatusCode, RunError> {
    st.service.delete_cron(parse_id::<CronId>(&cron_id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Encode one join frame as a server-sent event.
pub fn encode_sse_frame(frame: &JoinFrame) -> Bytes {
    match frame {
        JoinFrame::KeepAlive => Bytes::from_static(b": heartbeat\n\n"),
        JoinFrame::Event(event) => Bytes::from(format!(
            "id: {}\nevent: {}\ndata: {}\n\n",
            event.seq, event.mode, event.payload
        )),
    }
}

/// Encode one wait frame as a chunk of a JSON response body.
pub fn encode_wait_frame(frame: &WaitFrame) -> Bytes {
    match frame {
        WaitFrame::KeepAlive => Bytes::from_static(b"\n"),
        WaitFrame::Complete(value) => Bytes::from(value.to_string()),
    }
}

fn body_from<S>(frames: S) -> Body
where
    S: Stream<Item = Bytes> + Send + 'static,
{
    Body::from_stream(frames.map(Ok::<Bytes, Infallible>))
}

fn sse_body(stream: RunEventStream) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    (headers, body_from(stream.map(|frame| encode_sse_frame(&frame)))).into_response()
}

fn sse_response(run: &Run, stream: RunEventStream) -> Response {
    let mut response = sse_body(stream);
    response.headers_mut().extend(run_location(run));
    response
}

fn wait_response(run: &Run, stream: WaitStream) -> Response {
    let mut headers = run_location(run);
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    (headers, body_from(stream.map(|frame| encode_wait_frame(&frame)))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{StreamEvent, StreamMode};

    #[test]
    fn sse_frames_carry_id_event_and_data() {
        let frame = JoinFrame::Event(StreamEvent {
            seq: 7,
            mode: StreamMode::Values,
            payload: json!({"a": 1}),
        });
        assert_eq!(
            encode_sse_frame(&frame),
            Bytes::from("id: 7\nevent: values\ndata: {\"a\":1}\n\n")
        );
        assert_eq!(
            encode_sse_frame(&JoinFrame::KeepAlive),
            Bytes::from_static(b": heartbeat\n\n")
        );
    }

    #[test]
    fn query_flags_accept_common_spellings() {
        let parse = |query: &str| {
            let uri: axum::http::Uri = format!("/cancel?{query}").parse().unwrap();
            Query::<CancelParams>::try_from_uri(&uri).map(|Query(params)| params.wait)
        };
        for truthy in ["wait=true", "wait=yes", "wait=1", "wait=TRUE"] {
            assert!(parse(truthy).unwrap(), "{truthy}");
        }
        for falsy in ["wait=false", "wait=no", "wait=0", ""] {
            assert!(!parse(falsy).unwrap(), "{falsy}");
        }
        assert!(parse("wait=maybe").is_err());

        let uri: axum::http::Uri = "/stream?cancel_on_disconnect=1".parse().unwrap();
        let Query(params) = Query::<JoinStreamParams>::try_from_uri(&uri).unwrap();
        assert!(params.cancel_on_disconnect);
    }

    #[test]
    fn wait_keepalives_are_json_whitespace() {
        let mut body = Vec::new();
        body.extend_from_slice(&encode_wait_frame(&WaitFrame::KeepAlive));
        body.extend_from_slice(&encode_wait_frame(&WaitFrame::KeepAlive));
        body.extend_from_slice(&encode_wait_frame(&WaitFrame::Complete(json!({"done": true}))));
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed, json!({"done": true}));
    }

    #[test]
    fn last_event_id_must_be_numeric() {
        let mut headers = HeaderMap::new();
        assert_eq!(last_event_id(&headers).unwrap(), None);
        headers.insert(LAST_EVENT_ID, HeaderValue::from_static("12"));
        assert_eq!(last_event_id(&headers).unwrap(), Some(12));
        headers.insert(LAST_EVENT_ID, HeaderValue::from_static("abc"));
        assert!(matches!(
            last_event_id(&headers),
            Err(RunError::InvalidArgument(_))
        ));
    }

    #[test]
    fn errors_map_to_status_codes() {
        let response = RunError::InvalidArgument("bad".into()).into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let response = RunError::run_not_found(RunId::new()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
