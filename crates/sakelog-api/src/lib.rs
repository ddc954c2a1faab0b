use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use sakelog_core::{
    ancestors, build_subtree, build_tree, descendant_ids, has_id_in_trail,
    validate_name_and_description, Actor, Category, CategoryError, CategoryId, CategoryImage,
    CategoryLogEntry, CategoryPostRequest, CategoryTrailItem, ErrorCode, ErrorReport, MutationMode,
    ParentMap, Severity,
};
use sakelog_store_sqlite::{
    CategoryCommit, CommitOutcome, IntegrityReport, SchemaStatus, SqliteStore,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub mod image;
pub mod storage;

pub use crate::image::{DEFAULT_INLINE_MAX_WIDTH, MIN_INLINE_MAX_WIDTH};
pub use crate::storage::{LocalObjectStorage, ObjectStorage};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddRootRequest {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub readonly: bool,
    pub order: Option<i64>,
}

/// Why a category post was rejected. Each variant maps onto one stable [`ErrorCode`].
#[derive(Debug, thiserror::Error)]
pub enum CategoryPostError {
    #[error("failed to parse input: {0}")]
    ParseFailInput(String),
    #[error(transparent)]
    InvalidInput(#[from] CategoryError),
    #[error("category {id} cannot be placed under {parent}")]
    InvalidParent { id: CategoryId, parent: CategoryId },
    #[error("category {id} is at version {stored}, request claimed {claimed}")]
    InvalidVersion { id: CategoryId, stored: i64, claimed: i64 },
    #[error("invalid image file: {0}")]
    InvalidFile(#[source] crate::image::ImageError),
    #[error("a category named {name:?} already exists under {parent:?}")]
    DuplicateName { name: String, parent: Option<CategoryId> },
    #[error("root category {id} cannot be moved")]
    ParentCategoryMove { id: CategoryId },
    #[error("readonly category {id} cannot be moved from {from} to {to}")]
    ReadonlyCategoryMove { id: CategoryId, from: CategoryId, to: CategoryId },
    #[error("parent category {parent} does not exist")]
    UnknownParent { parent: CategoryId },
    #[error("category {id} has no logged version {version_no}")]
    VersionNotFound { id: CategoryId, version_no: i64 },
    #[error("category {id} does not exist")]
    NotFound { id: CategoryId },
    #[error("failed to upload category image: {0:#}")]
    UploadFailed(anyhow::Error),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl CategoryPostError {
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ParseFailInput(_) => ErrorCode::ParseFailInput,
            Self::InvalidInput(_) => ErrorCode::InvalidInput,
            Self::InvalidParent { .. } => ErrorCode::InvalidParent,
            Self::InvalidVersion { .. } => ErrorCode::InvalidVersion,
            Self::InvalidFile(_) => ErrorCode::InvalidFile,
            Self::DuplicateName { .. } => ErrorCode::DuplicateName,
            Self::ParentCategoryMove { .. } => ErrorCode::ParentCategoryMove,
            Self::ReadonlyCategoryMove { .. } => ErrorCode::ReadonlyCategoryMove,
            Self::UnknownParent { .. } => ErrorCode::UnknownParent,
            Self::VersionNotFound { .. } => ErrorCode::VersionNotFound,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::UploadFailed(_) => ErrorCode::UploadFailed,
            Self::Storage(_) => ErrorCode::Storage,
        }
    }

    /// Client-facing report carrying the offending input for diagnostics.
    #[must_use]
    pub fn report(&self, input: Option<serde_json::Value>) -> ErrorReport {
        ErrorReport::new(self.code(), input)
    }

    fn log(&self, input: Option<&serde_json::Value>) {
        let code = self.code();
        let input = input.map(ToString::to_string).unwrap_or_default();
        match code.severity() {
            Severity::Info => {
                tracing::info!(
                    code = code.as_str(),
                    error = %self,
                    input = %input,
                    "category post rejected"
                );
            }
            Severity::Error => {
                tracing::error!(
                    code = code.as_str(),
                    error = %self,
                    input = %input,
                    "category post failed"
                );
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CategoryApi {
    db_path: PathBuf,
    storage: Arc<dyn ObjectStorage>,
    inline_max_width: u32,
}

impl CategoryApi {
    #[must_use]
    pub fn new(db_path: PathBuf, storage: Arc<dyn ObjectStorage>) -> Self {
        Self { db_path, storage, inline_max_width: DEFAULT_INLINE_MAX_WIDTH }
    }

    /// Widths below [`MIN_INLINE_MAX_WIDTH`] are raised to it.
    #[must_use]
    pub fn with_inline_max_width(mut self, inline_max_width: u32) -> Self {
        self.inline_max_width = inline_max_width.max(MIN_INLINE_MAX_WIDTH);
        self
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        SqliteStore::open(&self.db_path)?.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = SqliteStore::open(&self.db_path)?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Write a consistent copy of the database to `out`.
    ///
    /// # Errors
    /// Returns an error when the database cannot be migrated or copied.
    pub fn backup(&self, out: &Path) -> Result<()> {
        self.open_store()?.backup_database(out)
    }

    /// Replace the database with the backup at `input` and report its schema status.
    ///
    /// # Errors
    /// Returns an error when the backup cannot be read or restored.
    pub fn restore(&self, input: &Path) -> Result<SchemaStatus> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.restore_database(input)?;
        store.schema_status()
    }

    /// Run storage and tree-shape integrity probes.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or probed.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.open_store()?.integrity_check()
    }

    /// Create or update one category.
    ///
    /// Rejections are logged at the severity of their [`ErrorCode`] before being returned.
    ///
    /// # Errors
    /// Returns a [`CategoryPostError`] describing the first rule the request broke, or the
    /// storage failure that aborted the commit.
    pub fn post_category(
        &self,
        request: &CategoryPostRequest,
        image: Option<&[u8]>,
        actor: &Actor,
    ) -> Result<CategoryId, CategoryPostError> {
        match self.apply_post(request, image, actor) {
            Ok(id) => Ok(id),
            Err(err) => {
                err.log(serde_json::to_value(request).ok().as_ref());
                Err(err)
            }
        }
    }

    fn apply_post(
        &self,
        request: &CategoryPostRequest,
        image: Option<&[u8]>,
        actor: &Actor,
    ) -> Result<CategoryId, CategoryPostError> {
        request.validate()?;
        let mut store = self.open_store()?;

        let old = match request.mode() {
            MutationMode::Create => None,
            MutationMode::Update(id) => Some(check_update(&store, id, request)?),
        };

        if store.get_category(request.parent)?.is_none() {
            return Err(CategoryPostError::UnknownParent { parent: request.parent });
        }
        if store
            .find_category_by_parent_and_name(Some(request.parent), &request.name, request.id)?
            .is_some()
        {
            return Err(CategoryPostError::DuplicateName {
                name: request.name.clone(),
                parent: Some(request.parent),
            });
        }

        let (resolved, uploaded_url) = self.resolve_image(&store, request, image, old.as_ref())?;
        let now = OffsetDateTime::now_utc();
        let record = match &old {
            None => Category {
                id: 0,
                name: request.name.clone(),
                parent: Some(request.parent),
                description: request.description.clone(),
                image_url: resolved.url,
                image_base64: resolved.base64,
                version_no: Some(1),
                order: None,
                readonly: false,
                create_user_id: actor.user_id.clone(),
                create_user_name: actor.user_name.clone(),
                update_user_id: actor.user_id.clone(),
                update_user_name: actor.user_name.clone(),
                updated_at: now,
                children: Vec::new(),
            },
            Some(old) => Category {
                id: old.id,
                name: request.name.clone(),
                parent: Some(request.parent),
                description: request.description.clone(),
                image_url: resolved.url,
                image_base64: resolved.base64,
                version_no: Some(old.current_version() + 1),
                order: old.order,
                readonly: old.readonly,
                create_user_id: old.create_user_id.clone(),
                create_user_name: old.create_user_name.clone(),
                update_user_id: actor.user_id.clone(),
                update_user_name: actor.user_name.clone(),
                updated_at: now,
                children: Vec::new(),
            },
        };

        let commit = match &old {
            None => CategoryCommit::Create(&record),
            Some(previous) => CategoryCommit::Update { previous, record: &record },
        };
        let outcome = store.commit_category(commit).map_err(|err| {
            warn_orphaned_upload(uploaded_url.as_deref(), request.id);
            CategoryPostError::Storage(err)
        })?;

        match outcome {
            CommitOutcome::Applied { id } => {
                tracing::info!(
                    category_id = id,
                    version_no = record.current_version(),
                    parent = request.parent,
                    "category committed"
                );
                Ok(id)
            }
            CommitOutcome::VersionConflict { stored } => {
                warn_orphaned_upload(uploaded_url.as_deref(), request.id);
                Err(CategoryPostError::InvalidVersion {
                    id: record.id,
                    stored: stored.unwrap_or(0),
                    claimed: request.version_no.unwrap_or(0),
                })
            }
            CommitOutcome::Missing => {
                warn_orphaned_upload(uploaded_url.as_deref(), request.id);
                Err(CategoryPostError::NotFound { id: record.id })
            }
        }
    }

    /// Pick the image fields for the next version, uploading a new file when one was sent.
    ///
    /// The second value is the URL of an object uploaded by this call, if any.
    fn resolve_image(
        &self,
        store: &SqliteStore,
        request: &CategoryPostRequest,
        file: Option<&[u8]>,
        old: Option<&Category>,
    ) -> Result<(CategoryImage, Option<String>), CategoryPostError> {
        if let Some(bytes) = file {
            let decoded = crate::image::decode(bytes).map_err(CategoryPostError::InvalidFile)?;
            let base64 = crate::image::resize_and_encode(
                &decoded.image,
                self.inline_max_width,
                crate::image::max_height_for_width(self.inline_max_width),
            )
            .map_err(CategoryPostError::InvalidFile)?;
            let url = self
                .storage
                .upload(bytes, decoded.content_type(), decoded.extension())
                .map_err(CategoryPostError::UploadFailed)?;
            return Ok((
                CategoryImage { base64: Some(base64), url: Some(url.clone()) },
                Some(url),
            ));
        }

        if let (Some(id), Some(version_no)) = (request.id, request.selected_version_no) {
            let Some(entry) = store.get_log_by_version(id, version_no)? else {
                return Err(CategoryPostError::VersionNotFound { id, version_no });
            };
            return Ok((entry.snapshot.image(), None));
        }

        Ok((old.map(Category::image).unwrap_or_default(), None))
    }

    /// Seed a top-level category. Roots never go through the post pipeline.
    ///
    /// # Errors
    /// Returns [`CategoryPostError::InvalidInput`] for bad fields,
    /// [`CategoryPostError::DuplicateName`] when another root has the name, or a storage error.
    pub fn add_root(
        &self,
        request: &AddRootRequest,
        actor: &Actor,
    ) -> Result<Category, CategoryPostError> {
        validate_name_and_description(&request.name, request.description.as_deref())?;
        let mut store = self.open_store()?;
        if store.find_category_by_parent_and_name(None, &request.name, None)?.is_some() {
            return Err(CategoryPostError::DuplicateName {
                name: request.name.clone(),
                parent: None,
            });
        }

        let mut record = Category {
            id: 0,
            name: request.name.clone(),
            parent: None,
            description: request.description.clone(),
            image_url: None,
            image_base64: None,
            version_no: Some(1),
            order: request.order,
            readonly: request.readonly,
            create_user_id: actor.user_id.clone(),
            create_user_name: actor.user_name.clone(),
            update_user_id: actor.user_id.clone(),
            update_user_name: actor.user_name.clone(),
            updated_at: OffsetDateTime::now_utc(),
            children: Vec::new(),
        };
        let outcome = store.commit_category(CategoryCommit::Create(&record))?;
        let CommitOutcome::Applied { id } = outcome else {
            return Err(CategoryPostError::Storage(anyhow::anyhow!("root insert was not applied")));
        };
        record.id = id;
        tracing::info!(category_id = record.id, "root category seeded");
        Ok(record)
    }

    /// Load one category.
    ///
    /// # Errors
    /// Returns an error when storage access fails.
    pub fn get_category(&self, id: CategoryId) -> Result<Option<Category>> {
        self.open_store()?.get_category(id)
    }

    /// Flat listing ordered by display order, then id.
    ///
    /// # Errors
    /// Returns an error when storage access fails.
    pub fn list_categories(&self) -> Result<Vec<Category>> {
        let mut categories = self.open_store()?.list_categories()?;
        categories.sort_by_key(|category| (category.order.unwrap_or(i64::MAX), category.id));
        Ok(categories)
    }

    /// Materialized forest of every root, or the single subtree under `root_id`.
    ///
    /// An unknown `root_id` yields an empty forest.
    ///
    /// # Errors
    /// Returns an error when storage access fails.
    pub fn category_tree(&self, root_id: Option<CategoryId>) -> Result<Vec<Category>> {
        let categories = self.open_store()?.list_categories()?;
        Ok(match root_id {
            None => build_tree(categories),
            Some(root_id) => build_subtree(categories, root_id).into_iter().collect(),
        })
    }

    /// Breadcrumb from the root down to `id`, inclusive, or `None` when `id` does not exist.
    ///
    /// # Errors
    /// Returns an error when storage access fails or the stored parent chain is corrupt.
    pub fn category_trail(&self, id: CategoryId) -> Result<Option<Vec<CategoryTrailItem>>> {
        let categories = self.open_store()?.list_categories()?;
        if !categories.iter().any(|category| category.id == id) {
            return Ok(None);
        }
        let parents: ParentMap =
            categories.iter().map(|category| (category.id, category.parent)).collect();
        let names = categories
            .into_iter()
            .map(|category| (category.id, category.name))
            .collect::<std::collections::BTreeMap<_, _>>();

        let mut chain = ancestors(&parents, id)?;
        chain.reverse();
        Ok(Some(
            chain
                .into_iter()
                .filter_map(|step| {
                    names.get(&step).map(|name| CategoryTrailItem { id: step, name: name.clone() })
                })
                .collect(),
        ))
    }

    /// `id` and every category below it, or `None` when `id` does not exist.
    ///
    /// # Errors
    /// Returns an error when storage access fails.
    pub fn descendant_ids(&self, id: CategoryId) -> Result<Option<Vec<CategoryId>>> {
        let ids = descendant_ids(&self.open_store()?.parent_map()?, id);
        Ok((!ids.is_empty()).then_some(ids))
    }

    /// Superseded versions of one category, newest first.
    ///
    /// # Errors
    /// Returns an error when storage access fails.
    pub fn list_logs(&self, id: CategoryId) -> Result<Vec<CategoryLogEntry>> {
        self.open_store()?.list_logs(id)
    }

    /// # Errors
    /// Returns an error when storage access fails.
    pub fn get_log(&self, id: CategoryId, version_no: i64) -> Result<Option<CategoryLogEntry>> {
        self.open_store()?.get_log_by_version(id, version_no)
    }
}

/// Structural rules for an update, checked before the version so that a stale client learns
/// about a forbidden move first.
fn check_update(
    store: &SqliteStore,
    id: CategoryId,
    request: &CategoryPostRequest,
) -> Result<Category, CategoryPostError> {
    let parents = store.parent_map()?;
    if has_id_in_trail(&parents, id, request.parent) {
        return Err(CategoryPostError::InvalidParent { id, parent: request.parent });
    }

    let Some(old) = store.get_category(id)? else {
        return Err(CategoryPostError::NotFound { id });
    };
    let Some(current_parent) = old.parent else {
        return Err(CategoryPostError::ParentCategoryMove { id });
    };
    if old.readonly && current_parent != request.parent {
        return Err(CategoryPostError::ReadonlyCategoryMove {
            id,
            from: current_parent,
            to: request.parent,
        });
    }

    let claimed = request.version_no.unwrap_or(0);
    if old.current_version() != claimed {
        return Err(CategoryPostError::InvalidVersion {
            id,
            stored: old.current_version(),
            claimed,
        });
    }
    Ok(old)
}

// TODO: delete the object once storage exposes a delete call.
fn warn_orphaned_upload(url: Option<&str>, category_id: Option<CategoryId>) {
    if let Some(url) = url {
        tracing::warn!(?category_id, url, "uploaded image orphaned by aborted commit");
    }
}
