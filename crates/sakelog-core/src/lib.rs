use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const NAME_MAX_CHARS: usize = 100;
pub const DESCRIPTION_MAX_CHARS: usize = 5000;

/// Upper bound on parent hops before a chain is treated as corrupt.
pub const MAX_ANCESTRY_DEPTH: usize = 1024;

pub type CategoryId = i64;

/// Adjacency list of the live tree: category id to its parent id.
pub type ParentMap = BTreeMap<CategoryId, Option<CategoryId>>;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CategoryError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("corrupt tree: {0}")]
    CorruptTree(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Actor {
    pub user_id: Option<String>,
    pub user_name: Option<String>,
}

impl Actor {
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn authenticated(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self { user_id: Some(user_id.into()), user_name: Some(user_name.into()) }
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.user_id.is_none()
    }
}

/// One step of a breadcrumb from a root down to a category.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CategoryTrailItem {
    pub id: CategoryId,
    pub name: String,
}

/// Image fields that travel together between live rows and log entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct CategoryImage {
    pub base64: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
    pub parent: Option<CategoryId>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub image_base64: Option<String>,
    /// Rows seeded by hand may predate versioning and carry no value.
    pub version_no: Option<i64>,
    pub order: Option<i64>,
    pub readonly: bool,
    pub create_user_id: Option<String>,
    pub create_user_name: Option<String>,
    pub update_user_id: Option<String>,
    pub update_user_name: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    /// Populated only by [`build_tree`] and [`build_subtree`]; never persisted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Category>,
}

impl Category {
    #[must_use]
    pub fn current_version(&self) -> i64 {
        self.version_no.unwrap_or(0)
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    #[must_use]
    pub fn image(&self) -> CategoryImage {
        CategoryImage { base64: self.image_base64.clone(), url: self.image_url.clone() }
    }
}

/// One superseded version of a category, as written to the change log.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CategoryLogEntry {
    #[serde(flatten)]
    pub snapshot: Category,
    #[serde(with = "time::serde::rfc3339")]
    pub logged_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CategoryPostRequest {
    pub id: Option<CategoryId>,
    pub name: String,
    pub parent: CategoryId,
    pub description: Option<String>,
    pub version_no: Option<i64>,
    pub selected_version_no: Option<i64>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MutationMode {
    Create,
    Update(CategoryId),
}

impl CategoryPostRequest {
    #[must_use]
    pub fn mode(&self) -> MutationMode {
        match self.id {
            Some(id) => MutationMode::Update(id),
            None => MutationMode::Create,
        }
    }

    /// Check field-level constraints before any business rule runs.
    ///
    /// # Errors
    /// Returns [`CategoryError::Validation`] when a field is missing, out of range, or too long,
    /// or when a rollback target is given for a category that does not exist yet.
    pub fn validate(&self) -> Result<(), CategoryError> {
        validate_name_and_description(&self.name, self.description.as_deref())?;
        if self.parent < 1 {
            return Err(CategoryError::Validation("parent must be >= 1".to_string()));
        }
        for (field, value) in [
            ("id", self.id),
            ("version_no", self.version_no),
            ("selected_version_no", self.selected_version_no),
        ] {
            if matches!(value, Some(v) if v < 1) {
                return Err(CategoryError::Validation(format!("{field} must be >= 1")));
            }
        }
        if self.id.is_none() && self.selected_version_no.is_some() {
            return Err(CategoryError::Validation(
                "selected_version_no requires id".to_string(),
            ));
        }
        Ok(())
    }
}

/// Field rules shared by posted categories and administratively seeded roots.
///
/// # Errors
/// Returns [`CategoryError::Validation`] for a blank or overlong name or an overlong description.
pub fn validate_name_and_description(
    name: &str,
    description: Option<&str>,
) -> Result<(), CategoryError> {
    if name.trim().is_empty() {
        return Err(CategoryError::Validation("name is required".to_string()));
    }
    if name.chars().count() > NAME_MAX_CHARS {
        return Err(CategoryError::Validation(format!(
            "name must be at most {NAME_MAX_CHARS} characters"
        )));
    }
    if let Some(description) = description {
        if description.chars().count() > DESCRIPTION_MAX_CHARS {
            return Err(CategoryError::Validation(format!(
                "description must be at most {DESCRIPTION_MAX_CHARS} characters"
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Error,
}

impl Severity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Error => "error",
        }
    }
}

/// Stable client-facing error codes for the category post pipeline.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ErrorCode {
    ParseFailInput,
    InvalidInput,
    InvalidParent,
    InvalidVersion,
    InvalidFile,
    DuplicateName,
    ParentCategoryMove,
    ReadonlyCategoryMove,
    UnknownParent,
    VersionNotFound,
    NotFound,
    UploadFailed,
    Storage,
}

impl ErrorCode {
    pub const ALL: [Self; 13] = [
        Self::ParseFailInput,
        Self::InvalidInput,
        Self::InvalidParent,
        Self::InvalidVersion,
        Self::InvalidFile,
        Self::DuplicateName,
        Self::ParentCategoryMove,
        Self::ReadonlyCategoryMove,
        Self::UnknownParent,
        Self::VersionNotFound,
        Self::NotFound,
        Self::UploadFailed,
        Self::Storage,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ParseFailInput => "CATEGORY-POST-001-ParseFailInput",
            Self::InvalidInput => "CATEGORY-POST-002-InvalidInput",
            Self::InvalidParent => "CATEGORY-POST-003-InvalidParent",
            Self::InvalidVersion => "CATEGORY-POST-004-InvalidVersion",
            Self::InvalidFile => "CATEGORY-POST-005-InvalidFile",
            Self::DuplicateName => "CATEGORY-POST-006-DuplicateName",
            Self::ParentCategoryMove => "CATEGORY-POST-007-ParentCategoryMove",
            Self::ReadonlyCategoryMove => "CATEGORY-POST-008-ReadonlyCategoryMove",
            Self::UnknownParent => "CATEGORY-POST-009-UnknownParent",
            Self::VersionNotFound => "CATEGORY-POST-010-VersionNotFound",
            Self::NotFound => "CATEGORY-POST-011-NotFound",
            Self::UploadFailed => "CATEGORY-POST-012-UploadFailed",
            Self::Storage => "CATEGORY-POST-013-Storage",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|code| code.as_str() == value)
    }

    #[must_use]
    pub fn status(self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::UploadFailed | Self::Storage => 500,
            _ => 400,
        }
    }

    /// Business-rule rejections are informational. Malformed input, undecodable files and
    /// storage faults are errors.
    #[must_use]
    pub fn severity(self) -> Severity {
        match self {
            Self::ParseFailInput
            | Self::InvalidInput
            | Self::InvalidFile
            | Self::UploadFailed
            | Self::Storage => Severity::Error,
            _ => Severity::Info,
        }
    }

    #[must_use]
    pub fn user_message(self) -> &'static str {
        match self {
            Self::ParseFailInput | Self::InvalidInput => "The submitted values are invalid.",
            Self::InvalidParent => "A category cannot be placed under itself or its descendants.",
            Self::InvalidVersion => {
                "This category was updated by someone else. Reload and try again."
            }
            Self::InvalidFile => "The uploaded file is invalid.",
            Self::DuplicateName => {
                "A category with the same name already exists under this parent."
            }
            Self::ParentCategoryMove => "Top-level categories cannot be moved.",
            Self::ReadonlyCategoryMove => "This category cannot be moved.",
            Self::UnknownParent => "The selected parent category does not exist.",
            Self::VersionNotFound => "The selected version does not exist.",
            Self::NotFound => "The category does not exist.",
            Self::UploadFailed => "The image could not be stored. Try again later.",
            Self::Storage => "An internal error occurred.",
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire shape of a rejected mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorReport {
    pub code: String,
    pub status: u16,
    pub level: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
}

impl ErrorReport {
    #[must_use]
    pub fn new(code: ErrorCode, input: Option<serde_json::Value>) -> Self {
        Self {
            code: code.as_str().to_string(),
            status: code.status(),
            level: code.severity(),
            message: code.user_message().to_string(),
            input,
        }
    }
}

#[must_use]
pub fn parent_map(categories: &[Category]) -> ParentMap {
    categories.iter().map(|category| (category.id, category.parent)).collect()
}

/// Walk parent pointers from `start` up to its root, returning the chain starting at `start`.
///
/// # Errors
/// Returns [`CategoryError::CorruptTree`] when the chain loops back on itself or exceeds
/// [`MAX_ANCESTRY_DEPTH`] hops.
pub fn ancestors(parents: &ParentMap, start: CategoryId) -> Result<Vec<CategoryId>, CategoryError> {
    let mut chain = Vec::new();
    let mut visited = BTreeSet::new();
    let mut cursor = Some(start);

    while let Some(current) = cursor {
        if !visited.insert(current) {
            return Err(CategoryError::CorruptTree(format!(
                "parent chain from {start} loops at {current}"
            )));
        }
        if chain.len() >= MAX_ANCESTRY_DEPTH {
            return Err(CategoryError::CorruptTree(format!(
                "parent chain from {start} exceeds {MAX_ANCESTRY_DEPTH} hops"
            )));
        }
        chain.push(current);
        cursor = parents.get(&current).copied().flatten();
    }

    Ok(chain)
}

/// True when making `proposed_parent` the parent of `candidate` would create a cycle.
///
/// A corrupt chain above `proposed_parent` is reported as unsafe.
#[must_use]
pub fn has_id_in_trail(
    parents: &ParentMap,
    candidate: CategoryId,
    proposed_parent: CategoryId,
) -> bool {
    if candidate == proposed_parent {
        return true;
    }
    match ancestors(parents, proposed_parent) {
        Ok(chain) => chain.contains(&candidate),
        Err(_) => true,
    }
}

/// `start` followed by every category below it, breadth first with ascending ids per level.
///
/// Empty when `start` is not in `parents`. Each id is visited once, so looping rows terminate.
#[must_use]
pub fn descendant_ids(parents: &ParentMap, start: CategoryId) -> Vec<CategoryId> {
    if !parents.contains_key(&start) {
        return Vec::new();
    }
    let mut children_of: BTreeMap<CategoryId, Vec<CategoryId>> = BTreeMap::new();
    for (&id, parent) in parents {
        if let Some(parent) = parent {
            children_of.entry(*parent).or_default().push(id);
        }
    }

    let mut found = vec![start];
    let mut visited = BTreeSet::from([start]);
    let mut next = 0;
    while let Some(&current) = found.get(next) {
        next += 1;
        for &child in children_of.get(&current).into_iter().flatten() {
            if visited.insert(child) {
                found.push(child);
            }
        }
    }
    found
}

/// Nest categories under their parents, roots first, siblings ordered by `order` then `id`.
///
/// Nodes not reachable from a root are left out.
#[must_use]
pub fn build_tree(categories: Vec<Category>) -> Vec<Category> {
    let mut roots = categories
        .iter()
        .filter(|category| category.is_root())
        .map(sibling_sort_key)
        .collect::<Vec<_>>();
    roots.sort_unstable();
    let starts = roots.into_iter().map(|(_, id)| id).collect::<Vec<_>>();
    materialize(categories, &starts)
}

/// Materialize the subtree rooted at `root_id`, or `None` when it does not exist.
#[must_use]
pub fn build_subtree(categories: Vec<Category>, root_id: CategoryId) -> Option<Category> {
    materialize(categories, &[root_id]).into_iter().next()
}

fn sibling_sort_key(category: &Category) -> (i64, CategoryId) {
    (category.order.unwrap_or(i64::MAX), category.id)
}

fn materialize(categories: Vec<Category>, starts: &[CategoryId]) -> Vec<Category> {
    let mut children_of: BTreeMap<CategoryId, Vec<(i64, CategoryId)>> = BTreeMap::new();
    let mut nodes: BTreeMap<CategoryId, Category> = BTreeMap::new();
    for mut category in categories {
        category.children.clear();
        if let Some(parent) = category.parent {
            children_of.entry(parent).or_default().push(sibling_sort_key(&category));
        }
        nodes.insert(category.id, category);
    }
    for siblings in children_of.values_mut() {
        siblings.sort_unstable();
    }

    let mut visited = BTreeSet::new();
    let mut pre_order = Vec::new();
    let mut stack = starts.iter().rev().copied().collect::<Vec<_>>();
    while let Some(id) = stack.pop() {
        if !nodes.contains_key(&id) || !visited.insert(id) {
            continue;
        }
        pre_order.push(id);
        if let Some(children) = children_of.get(&id) {
            stack.extend(children.iter().rev().map(|(_, child)| *child));
        }
    }

    // Children precede their parent in reverse pre-order, so each subtree is complete
    // by the time its parent is assembled.
    let mut assembled: BTreeMap<CategoryId, Category> = BTreeMap::new();
    for id in pre_order.iter().rev() {
        let Some(mut node) = nodes.remove(id) else {
            continue;
        };
        if let Some(children) = children_of.get(id) {
            node.children =
                children.iter().filter_map(|(_, child)| assembled.remove(child)).collect();
        }
        assembled.insert(*id, node);
    }

    starts.iter().filter_map(|id| assembled.remove(id)).collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use time::Duration;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn mk_category(id: CategoryId, name: &str, parent: Option<CategoryId>) -> Category {
        Category {
            id,
            name: name.to_string(),
            parent,
            description: None,
            image_url: None,
            image_base64: None,
            version_no: Some(1),
            order: None,
            readonly: false,
            create_user_id: None,
            create_user_name: None,
            update_user_id: None,
            update_user_name: None,
            updated_at: fixture_time(),
            children: Vec::new(),
        }
    }

    fn mk_request(id: Option<CategoryId>, name: &str, parent: CategoryId) -> CategoryPostRequest {
        CategoryPostRequest {
            id,
            name: name.to_string(),
            parent,
            description: None,
            version_no: None,
            selected_version_no: None,
        }
    }

    fn assert_validation_error_contains(request: &CategoryPostRequest, expected: &str) {
        let err = match request.validate() {
            Ok(()) => panic!("expected validation error containing: {expected}"),
            Err(err) => err,
        };
        assert!(err.to_string().contains(expected), "error `{err}` did not contain `{expected}`");
    }

    // Sake(1) -> Junmai(2) -> Ginjo(3), Sake(1) -> Honjozo(4), Shochu(5)
    fn fixture_parents() -> ParentMap {
        BTreeMap::from([(1, None), (2, Some(1)), (3, Some(2)), (4, Some(1)), (5, None)])
    }

    #[test]
    fn validate_accepts_minimal_create() {
        assert_eq!(mk_request(None, "Junmai", 1).validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_blank_name() {
        assert_validation_error_contains(&mk_request(None, "  ", 1), "name is required");
    }

    #[test]
    fn validate_counts_name_length_in_characters() {
        let at_limit = "酒".repeat(NAME_MAX_CHARS);
        assert_eq!(mk_request(None, &at_limit, 1).validate(), Ok(()));

        let over_limit = "酒".repeat(NAME_MAX_CHARS + 1);
        assert_validation_error_contains(&mk_request(None, &over_limit, 1), "at most 100");
    }

    #[test]
    fn validate_rejects_long_description() {
        let mut request = mk_request(None, "Junmai", 1);
        request.description = Some("a".repeat(DESCRIPTION_MAX_CHARS + 1));
        assert_validation_error_contains(&request, "description must be at most 5000");
    }

    #[test]
    fn validate_rejects_non_positive_numbers() {
        assert_validation_error_contains(&mk_request(None, "Junmai", 0), "parent must be >= 1");
        assert_validation_error_contains(&mk_request(Some(0), "Junmai", 1), "id must be >= 1");

        let mut request = mk_request(Some(2), "Junmai", 1);
        request.version_no = Some(0);
        assert_validation_error_contains(&request, "version_no must be >= 1");
    }

    #[test]
    fn validate_rejects_rollback_target_on_create() {
        let mut request = mk_request(None, "Junmai", 1);
        request.selected_version_no = Some(1);
        assert_validation_error_contains(&request, "selected_version_no requires id");
    }

    #[test]
    fn mode_is_derived_from_id_presence() {
        assert_eq!(mk_request(None, "a", 1).mode(), MutationMode::Create);
        assert_eq!(mk_request(Some(7), "a", 1).mode(), MutationMode::Update(7));
    }

    #[test]
    fn error_codes_parse_back_from_their_wire_form() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::parse(code.as_str()), Some(code));
        }
        assert_eq!(ErrorCode::parse("CATEGORY-POST-999-Nope"), None);
    }

    #[test]
    fn business_rule_codes_are_informational_bad_requests() {
        for code in [
            ErrorCode::InvalidParent,
            ErrorCode::InvalidVersion,
            ErrorCode::DuplicateName,
            ErrorCode::ParentCategoryMove,
            ErrorCode::ReadonlyCategoryMove,
        ] {
            assert_eq!(code.status(), 400);
            assert_eq!(code.severity(), Severity::Info);
        }
        assert_eq!(ErrorCode::Storage.status(), 500);
        assert_eq!(ErrorCode::Storage.severity(), Severity::Error);
        assert_eq!(ErrorCode::InvalidFile.status(), 400);
        assert_eq!(ErrorCode::InvalidFile.severity(), Severity::Error);
        assert_eq!(ErrorCode::NotFound.status(), 404);
    }

    #[test]
    fn descendant_ids_include_start_and_everything_below() {
        let parents = fixture_parents();
        assert_eq!(descendant_ids(&parents, 1), vec![1, 2, 4, 3]);
        assert_eq!(descendant_ids(&parents, 2), vec![2, 3]);
        assert_eq!(descendant_ids(&parents, 5), vec![5]);
        assert!(descendant_ids(&parents, 99).is_empty());
    }

    #[test]
    fn descendant_ids_terminate_on_looping_rows() {
        let parents = BTreeMap::from([(1, Some(2)), (2, Some(1))]);
        assert_eq!(descendant_ids(&parents, 1), vec![1, 2]);
    }

    #[test]
    fn trail_rejects_self_and_descendants() {
        let parents = fixture_parents();
        assert!(has_id_in_trail(&parents, 2, 2));
        assert!(has_id_in_trail(&parents, 2, 3));
        assert!(has_id_in_trail(&parents, 1, 3));
    }

    #[test]
    fn trail_allows_siblings_ancestors_and_other_roots() {
        let parents = fixture_parents();
        assert!(!has_id_in_trail(&parents, 3, 4));
        assert!(!has_id_in_trail(&parents, 3, 1));
        assert!(!has_id_in_trail(&parents, 2, 5));
    }

    #[test]
    fn trail_is_unsafe_on_corrupt_loop() {
        let mut parents = fixture_parents();
        parents.insert(6, Some(7));
        parents.insert(7, Some(6));
        assert!(has_id_in_trail(&parents, 2, 6));
        assert!(matches!(ancestors(&parents, 6), Err(CategoryError::CorruptTree(_))));
    }

    #[test]
    fn trail_is_unsafe_past_depth_bound() {
        let depth = i64::try_from(MAX_ANCESTRY_DEPTH).unwrap_or(i64::MAX) + 10;
        let mut parents = ParentMap::new();
        parents.insert(1, None);
        for id in 2..=depth {
            parents.insert(id, Some(id - 1));
        }
        assert!(has_id_in_trail(&parents, depth + 1, depth));
    }

    #[test]
    fn ancestors_stop_at_missing_parent() {
        let parents = BTreeMap::from([(2, Some(99))]);
        assert_eq!(ancestors(&parents, 2), Ok(vec![2, 99]));
    }

    #[test]
    fn build_tree_nests_children_in_sibling_order() {
        let mut ginjo = mk_category(3, "Ginjo", Some(2));
        ginjo.order = Some(1);
        let mut honjozo = mk_category(4, "Honjozo", Some(1));
        honjozo.order = Some(0);
        let categories = vec![
            ginjo,
            mk_category(5, "Shochu", None),
            mk_category(2, "Junmai", Some(1)),
            honjozo,
            mk_category(1, "Sake", None),
        ];

        let tree = build_tree(categories);
        let root_ids = tree.iter().map(|c| c.id).collect::<Vec<_>>();
        assert_eq!(root_ids, vec![1, 5]);

        let sake_children = tree[0].children.iter().map(|c| c.id).collect::<Vec<_>>();
        assert_eq!(sake_children, vec![4, 2]);
        assert_eq!(tree[0].children[1].children[0].name, "Ginjo");
    }

    #[test]
    fn build_tree_skips_unreachable_loops() {
        let categories = vec![
            mk_category(1, "Sake", None),
            mk_category(6, "Loop A", Some(7)),
            mk_category(7, "Loop B", Some(6)),
        ];
        let tree = build_tree(categories);
        assert_eq!(tree.len(), 1);
        assert!(tree[0].children.is_empty());
    }

    #[test]
    fn build_subtree_returns_none_for_unknown_root() {
        let categories = vec![mk_category(1, "Sake", None), mk_category(2, "Junmai", Some(1))];
        assert!(build_subtree(categories.clone(), 42).is_none());

        let subtree = match build_subtree(categories, 2) {
            Some(subtree) => subtree,
            None => panic!("subtree for existing id should materialize"),
        };
        assert_eq!(subtree.name, "Junmai");
        assert!(subtree.children.is_empty());
    }

    #[test]
    fn children_are_not_serialized_when_empty() {
        let value = match serde_json::to_value(mk_category(1, "Sake", None)) {
            Ok(value) => value,
            Err(err) => panic!("category should serialize: {err}"),
        };
        assert!(value.get("children").is_none());
        assert_eq!(
            value.get("updated_at").and_then(serde_json::Value::as_str),
            Some("2023-11-14T22:13:20Z")
        );
    }

    proptest! {
        #[test]
        fn property_guarded_reparenting_keeps_tree_acyclic(
            seeds in proptest::collection::vec(any::<u32>(), 1..40),
            moves in proptest::collection::vec((any::<u32>(), any::<u32>()), 0..80),
        ) {
            let size = i64::try_from(seeds.len()).unwrap_or(0) + 1;
            let mut parents = ParentMap::new();
            parents.insert(1, None);
            for (index, seed) in seeds.iter().enumerate() {
                let id = i64::try_from(index).unwrap_or(0) + 2;
                parents.insert(id, Some(1 + i64::from(*seed) % (id - 1)));
            }

            for (node_seed, parent_seed) in moves {
                let node = 1 + i64::from(node_seed) % size;
                let proposed = 1 + i64::from(parent_seed) % size;
                if node == 1 || has_id_in_trail(&parents, node, proposed) {
                    continue;
                }
                parents.insert(node, Some(proposed));
            }

            for id in parents.keys() {
                let chain = ancestors(&parents, *id);
                prop_assert!(chain.is_ok());
                let chain = chain.unwrap_or_default();
                prop_assert_eq!(chain.last().copied(), Some(1));
            }
        }
    }
}
