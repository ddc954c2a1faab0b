use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use sakelog_api::{
    AddRootRequest, CategoryApi, CategoryPostError, LocalObjectStorage, API_CONTRACT_VERSION,
    DEFAULT_INLINE_MAX_WIDTH, MIN_INLINE_MAX_WIDTH,
};
use sakelog_core::{
    Actor, Category, CategoryId, CategoryLogEntry, CategoryPostRequest, CategoryTrailItem,
    ErrorCode, ErrorReport,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
const USER_ID_HEADER: &str = "x-user-id";
const USER_NAME_HEADER: &str = "x-user-name";

#[derive(Debug, Clone)]
struct ServiceState {
    api: CategoryApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: ErrorReport,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct PostResult {
    id: CategoryId,
}

#[derive(Debug, Clone, Deserialize)]
struct TreeQuery {
    root_id: Option<CategoryId>,
}

/// Raw multipart fields, kept as text so an unparseable value can be echoed back.
#[derive(Debug, Default, Serialize)]
struct PostForm {
    id: Option<String>,
    name: Option<String>,
    parent: Option<String>,
    description: Option<String>,
    version_no: Option<String>,
    selected_version_no: Option<String>,
    #[serde(skip)]
    image: Option<Vec<u8>>,
}

#[derive(Debug, Parser)]
#[command(name = "sakelog-service")]
#[command(about = "HTTP service for the Sakelog category tree")]
struct Args {
    #[arg(long, default_value = "./sakelog.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Directory uploaded category images are written to.
    #[arg(long, default_value = "./objects")]
    object_dir: PathBuf,
    /// URL prefix under which `object_dir` is served.
    #[arg(long, default_value = "http://127.0.0.1:4020/objects")]
    public_base_url: String,
    #[arg(
        long,
        default_value_t = DEFAULT_INLINE_MAX_WIDTH,
        value_parser = clap::value_parser!(u32).range(i64::from(MIN_INLINE_MAX_WIDTH)..)
    )]
    inline_max_width: u32,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn report(error: ErrorReport) -> Self {
        let status =
            StatusCode::from_u16(error.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self { status, service_contract_version: SERVICE_CONTRACT_VERSION, error }
    }

    fn post(err: &CategoryPostError, input: Option<serde_json::Value>) -> Self {
        Self::report(err.report(input))
    }

    fn storage(err: &anyhow::Error) -> Self {
        tracing::error!(error = %format!("{err:#}"), "request failed");
        Self::report(ErrorReport::new(ErrorCode::Storage, None))
    }

    fn not_found(input: serde_json::Value) -> Self {
        Self::report(ErrorReport::new(ErrorCode::NotFound, Some(input)))
    }

    fn unparseable(message: &str, form: &PostForm) -> Self {
        let input = serde_json::to_value(form).ok();
        let error = CategoryPostError::ParseFailInput(message.to_string());
        tracing::error!(
            code = ErrorCode::ParseFailInput.as_str(),
            error = %error,
            "category post input unparseable"
        );
        Self::post(&error, input)
    }
}

impl PostForm {
    async fn read(
        &mut self,
        multipart: Result<Multipart, MultipartRejection>,
    ) -> Result<(), String> {
        let mut multipart = multipart.map_err(|err| err.body_text())?;
        while let Some(field) = multipart.next_field().await.map_err(|err| err.body_text())? {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            if name == "image" {
                let bytes = field.bytes().await.map_err(|err| err.body_text())?;
                // Browsers send an empty part when no file was chosen.
                if !bytes.is_empty() {
                    self.image = Some(bytes.to_vec());
                }
                continue;
            }

            let value = field.text().await.map_err(|err| err.body_text())?;
            match name.as_str() {
                "id" => self.id = Some(value),
                "name" => self.name = Some(value),
                "parent" => self.parent = Some(value),
                "description" => self.description = Some(value),
                "version_no" => self.version_no = Some(value),
                "selected_version_no" => self.selected_version_no = Some(value),
                _ => {}
            }
        }
        Ok(())
    }

    fn to_request(&self) -> Result<CategoryPostRequest, String> {
        let parent = parse_optional_integer("parent", self.parent.as_deref())?
            .ok_or_else(|| "parent is required".to_string())?;
        Ok(CategoryPostRequest {
            id: parse_optional_integer("id", self.id.as_deref())?,
            name: self.name.clone().unwrap_or_default(),
            parent,
            description: self.description.clone().filter(|value| !value.is_empty()),
            version_no: parse_optional_integer("version_no", self.version_no.as_deref())?,
            selected_version_no: parse_optional_integer(
                "selected_version_no",
                self.selected_version_no.as_deref(),
            )?,
        })
    }
}

fn parse_optional_integer(field: &str, value: Option<&str>) -> Result<Option<i64>, String> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value
            .parse::<i64>()
            .map(Some)
            .map_err(|_| format!("{field} must be an integer, got {value:?}")),
    }
}

/// Identity is asserted by the upstream gateway; absent headers mean an anonymous caller.
fn actor_from_headers(headers: &HeaderMap) -> Actor {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    Actor { user_id: header(USER_ID_HEADER), user_name: header(USER_NAME_HEADER) }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/category/post", post(category_post))
        .route("/v1/category/root", post(category_add_root))
        .route("/v1/categories", get(categories_list))
        .route("/v1/categories/tree", get(categories_tree))
        .route("/v1/category/:id", get(category_show))
        .route("/v1/category/:id/trail", get(category_trail))
        .route("/v1/category/:id/descendants", get(category_descendants))
        .route("/v1/category/:id/logs", get(category_logs))
        .route("/v1/category/:id/logs/:version_no", get(category_log_show))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let storage = Arc::new(LocalObjectStorage::new(args.object_dir, args.public_base_url));
    let api = CategoryApi::new(args.db, storage).with_inline_max_width(args.inline_max_width);
    api.migrate(false)?;

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "sakelog service listening");
    axum::serve(listener, app(ServiceState { api })).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<sakelog_store_sqlite::SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| ServiceError::storage(&err))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<sakelog_api::MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run).map_err(|err| ServiceError::storage(&err))?;
    Ok(Json(envelope(result)))
}

async fn category_post(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ServiceEnvelope<PostResult>>, ServiceError> {
    let mut form = PostForm::default();
    if let Err(message) = form.read(multipart).await {
        return Err(ServiceError::unparseable(&message, &form));
    }
    let request = form.to_request().map_err(|message| ServiceError::unparseable(&message, &form))?;

    let actor = actor_from_headers(&headers);
    let id = state
        .api
        .post_category(&request, form.image.as_deref(), &actor)
        .map_err(|err| ServiceError::post(&err, serde_json::to_value(&request).ok()))?;
    Ok(Json(envelope(PostResult { id })))
}

async fn category_add_root(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<AddRootRequest>,
) -> Result<Json<ServiceEnvelope<Category>>, ServiceError> {
    let actor = actor_from_headers(&headers);
    let root = state
        .api
        .add_root(&request, &actor)
        .map_err(|err| ServiceError::post(&err, serde_json::to_value(&request).ok()))?;
    Ok(Json(envelope(root)))
}

async fn categories_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<Category>>>, ServiceError> {
    let categories = state.api.list_categories().map_err(|err| ServiceError::storage(&err))?;
    Ok(Json(envelope(categories)))
}

async fn categories_tree(
    State(state): State<ServiceState>,
    Query(query): Query<TreeQuery>,
) -> Result<Json<ServiceEnvelope<Vec<Category>>>, ServiceError> {
    let forest =
        state.api.category_tree(query.root_id).map_err(|err| ServiceError::storage(&err))?;
    if let Some(root_id) = query.root_id {
        if forest.is_empty() {
            return Err(ServiceError::not_found(serde_json::json!({ "root_id": root_id })));
        }
    }
    Ok(Json(envelope(forest)))
}

async fn category_show(
    State(state): State<ServiceState>,
    Path(id): Path<CategoryId>,
) -> Result<Json<ServiceEnvelope<Category>>, ServiceError> {
    let category = state
        .api
        .get_category(id)
        .map_err(|err| ServiceError::storage(&err))?
        .ok_or_else(|| ServiceError::not_found(serde_json::json!({ "id": id })))?;
    Ok(Json(envelope(category)))
}

async fn category_trail(
    State(state): State<ServiceState>,
    Path(id): Path<CategoryId>,
) -> Result<Json<ServiceEnvelope<Vec<CategoryTrailItem>>>, ServiceError> {
    let trail = state
        .api
        .category_trail(id)
        .map_err(|err| ServiceError::storage(&err))?
        .ok_or_else(|| ServiceError::not_found(serde_json::json!({ "id": id })))?;
    Ok(Json(envelope(trail)))
}

async fn category_descendants(
    State(state): State<ServiceState>,
    Path(id): Path<CategoryId>,
) -> Result<Json<ServiceEnvelope<Vec<CategoryId>>>, ServiceError> {
    let ids = state
        .api
        .descendant_ids(id)
        .map_err(|err| ServiceError::storage(&err))?
        .ok_or_else(|| ServiceError::not_found(serde_json::json!({ "id": id })))?;
    Ok(Json(envelope(ids)))
}

async fn category_logs(
    State(state): State<ServiceState>,
    Path(id): Path<CategoryId>,
) -> Result<Json<ServiceEnvelope<Vec<CategoryLogEntry>>>, ServiceError> {
    let logs = state.api.list_logs(id).map_err(|err| ServiceError::storage(&err))?;
    Ok(Json(envelope(logs)))
}

async fn category_log_show(
    State(state): State<ServiceState>,
    Path((id, version_no)): Path<(CategoryId, i64)>,
) -> Result<Json<ServiceEnvelope<CategoryLogEntry>>, ServiceError> {
    let entry = state
        .api
        .get_log(id, version_no)
        .map_err(|err| ServiceError::storage(&err))?
        .ok_or_else(|| {
            ServiceError::not_found(serde_json::json!({ "id": id, "version_no": version_no }))
        })?;
    Ok(Json(envelope(entry)))
}
