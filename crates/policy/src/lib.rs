//! Visibility and ownership rules.
//!
//! Every function here is a pure function of its arguments: callers fetch candidate documents,
//! the policy decides. Read denials on hidden documents are reported as [`PolicyError::NotFound`]
//! so that existence of a private document never leaks; ownership denials on a document the
//! caller can already see are [`PolicyError::Forbidden`].

use robokache_contracts::{Document, DocumentId, Principal, VisibilityTier};

/// Lowest tier reachable by anyone who knows a document's ID.
pub const DIRECT_ACCESS_BAR: VisibilityTier = VisibilityTier::Shareable;

/// Lowest tier that shows up in the top-level listing for non-owners.
pub const LISTING_BAR: VisibilityTier = VisibilityTier::Public;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    BadRequest(String),
    Unauthorized,
    Forbidden,
    NotFound,
}

impl PolicyError {
    pub fn code(&self) -> &'static str {
        match self {
            PolicyError::BadRequest(_) => "ERR_BAD_REQUEST",
            PolicyError::Unauthorized => "ERR_AUTH_REQUIRED",
            PolicyError::Forbidden => "ERR_FORBIDDEN",
            PolicyError::NotFound => "ERR_NOT_FOUND",
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        PolicyError::BadRequest(message.into())
    }
}

impl std::fmt::Display for PolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyError::BadRequest(message) => write!(f, "bad request: {}", message),
            PolicyError::Unauthorized => write!(f, "authentication required"),
            PolicyError::Forbidden => write!(f, "you do not own this document"),
            PolicyError::NotFound => write!(f, "document not found"),
        }
    }
}

impl std::error::Error for PolicyError {}

/// What the caller asked for as a parent, after lookup.
#[derive(Debug, Clone, Copy)]
pub enum ParentCandidate<'a> {
    Unspecified,
    Missing,
    Found(&'a Document),
}

impl<'a> ParentCandidate<'a> {
    pub fn from_lookup(requested: bool, found: Option<&'a Document>) -> Self {
        match (requested, found) {
            (false, _) => ParentCandidate::Unspecified,
            (true, None) => ParentCandidate::Missing,
            (true, Some(document)) => ParentCandidate::Found(document),
        }
    }
}

fn is_owner(principal: Option<&Principal>, document: &Document) -> bool {
    principal.is_some_and(|p| *p == document.owner)
}

pub fn can_view(principal: Option<&Principal>, document: &Document) -> bool {
    is_owner(principal, document) || document.visibility >= DIRECT_ACCESS_BAR
}

pub fn is_listable(principal: Option<&Principal>, document: &Document) -> bool {
    is_owner(principal, document) || document.visibility >= LISTING_BAR
}

pub fn filter_listable(principal: Option<&Principal>, candidates: Vec<Document>) -> Vec<Document> {
    candidates
        .into_iter()
        .filter(|document| is_listable(principal, document))
        .collect()
}

/// Children of a document the caller can already view use the direct-access bar.
pub fn filter_viewable(principal: Option<&Principal>, candidates: Vec<Document>) -> Vec<Document> {
    candidates
        .into_iter()
        .filter(|document| can_view(principal, document))
        .collect()
}

pub fn can_create(principal: Option<&Principal>) -> Result<&Principal, PolicyError> {
    principal.ok_or(PolicyError::Unauthorized)
}

pub fn can_edit(principal: Option<&Principal>, document: &Document) -> bool {
    is_owner(principal, document)
}

pub fn can_delete(principal: Option<&Principal>, document: &Document) -> bool {
    can_edit(principal, document)
}

pub fn owned_flag(principal: Option<&Principal>, document: &Document) -> bool {
    is_owner(principal, document)
}

pub fn validate_parent_assignment(
    principal: &Principal,
    proposed_visibility: VisibilityTier,
    parent: ParentCandidate<'_>,
) -> Result<(), PolicyError> {
    let parent = match parent {
        ParentCandidate::Unspecified => return Ok(()),
        ParentCandidate::Missing => {
            return Err(PolicyError::bad_request("parent document does not exist"));
        }
        ParentCandidate::Found(parent) => parent,
    };

    // Missing and foreign parents share one message so ownership is not revealed.
    if parent.owner != *principal {
        return Err(PolicyError::bad_request("parent document does not exist"));
    }

    if parent.visibility < proposed_visibility {
        return Err(PolicyError::bad_request(format!(
            "a {} document cannot be placed under a {} parent",
            proposed_visibility, parent.visibility
        )));
    }

    Ok(())
}

pub fn validate_children_visibility(
    proposed_visibility: VisibilityTier,
    children: &[Document],
) -> Result<(), PolicyError> {
    match children
        .iter()
        .map(|child| child.visibility)
        .filter(|visibility| *visibility > proposed_visibility)
        .max()
    {
        None => Ok(()),
        Some(widest) => Err(PolicyError::bad_request(format!(
            "cannot make this document {} while it has {} children",
            proposed_visibility, widest
        ))),
    }
}

/// `ancestry` is the chain from the proposed parent up to its root, proposed parent first.
pub fn validate_no_cycle(document: DocumentId, ancestry: &[DocumentId]) -> Result<(), PolicyError> {
    if ancestry.contains(&document) {
        return Err(PolicyError::bad_request("a document cannot be its own ancestor"));
    }
    Ok(())
}

pub fn authorize_read(
    principal: Option<&Principal>,
    document: Option<Document>,
) -> Result<Document, PolicyError> {
    match document {
        Some(document) if can_view(principal, &document) => Ok(document),
        _ => Err(PolicyError::NotFound),
    }
}

pub fn authorize_write(
    principal: Option<&Principal>,
    document: Option<Document>,
) -> Result<Document, PolicyError> {
    if principal.is_none() {
        return Err(PolicyError::Unauthorized);
    }

    let document = authorize_read(principal, document)?;
    if !can_edit(principal, &document) {
        return Err(PolicyError::Forbidden);
    }
    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use robokache_contracts::Metadata;

    fn doc(id: i64, owner: &str, visibility: VisibilityTier) -> Document {
        Document {
            id: DocumentId::new(id).unwrap(),
            owner: Principal::new(owner),
            parent: None,
            visibility,
            metadata: Metadata::new(),
            created_at: Utc::now(),
        }
    }

    fn user1() -> Principal {
        Principal::new("user1@example.com")
    }

    fn user2() -> Principal {
        Principal::new("user2@example.com")
    }

    fn any_tier() -> impl Strategy<Value = VisibilityTier> {
        prop::sample::select(VisibilityTier::ALL.to_vec())
    }

    #[test]
    fn owner_sees_everything_others_need_shareable() {
        let owner = user1();
        let other = user2();
        for tier in VisibilityTier::ALL {
            let d = doc(1, owner.as_str(), tier);
            assert!(can_view(Some(&owner), &d));
            assert_eq!(can_view(Some(&other), &d), tier >= VisibilityTier::Shareable);
            assert_eq!(can_view(None, &d), tier >= VisibilityTier::Shareable);
        }
    }

    #[test]
    fn anonymous_listing_only_shows_public() {
        let docs = vec![
            doc(1, "user1@example.com", VisibilityTier::Private),
            doc(2, "user1@example.com", VisibilityTier::Shareable),
            doc(3, "user1@example.com", VisibilityTier::Public),
        ];

        let anonymous = filter_listable(None, docs.clone());
        assert_eq!(anonymous.len(), 1);
        assert_eq!(anonymous[0].visibility, VisibilityTier::Public);

        let owner = user1();
        assert_eq!(filter_listable(Some(&owner), docs).len(), 3);
    }

    #[test]
    fn shareable_is_viewable_by_id_but_not_listed() {
        let d = doc(1, "user2@example.com", VisibilityTier::Shareable);
        let viewer = user1();
        assert!(can_view(Some(&viewer), &d));
        assert!(!owned_flag(Some(&viewer), &d));
        assert!(!is_listable(None, &d));
        assert!(!is_listable(Some(&viewer), &d));
    }

    #[test]
    fn hidden_and_missing_documents_are_indistinguishable() {
        let viewer = user1();
        let hidden = doc(1, "user2@example.com", VisibilityTier::Private);

        let hidden_err = authorize_read(Some(&viewer), Some(hidden)).unwrap_err();
        let missing_err = authorize_read(Some(&viewer), None).unwrap_err();
        assert_eq!(hidden_err, PolicyError::NotFound);
        assert_eq!(hidden_err, missing_err);
    }

    #[test]
    fn editing_a_visible_foreign_document_is_forbidden() {
        let viewer = user1();
        let public = doc(1, "user2@example.com", VisibilityTier::Public);
        assert_eq!(
            authorize_write(Some(&viewer), Some(public)),
            Err(PolicyError::Forbidden)
        );

        let private = doc(2, "user2@example.com", VisibilityTier::Private);
        assert_eq!(
            authorize_write(Some(&viewer), Some(private)),
            Err(PolicyError::NotFound)
        );

        let own = doc(3, "user1@example.com", VisibilityTier::Invisible);
        assert!(authorize_write(Some(&viewer), Some(own)).is_ok());
    }

    #[test]
    fn anonymous_writes_require_authentication() {
        let public = doc(1, "user2@example.com", VisibilityTier::Public);
        assert_eq!(authorize_write(None, Some(public)), Err(PolicyError::Unauthorized));
        assert_eq!(authorize_write(None, None), Err(PolicyError::Unauthorized));
        assert_eq!(can_create(None), Err(PolicyError::Unauthorized));
        assert!(!can_delete(None, &doc(2, "user2@example.com", VisibilityTier::Public)));
    }

    #[test]
    fn parent_assignment_rules() {
        let owner = user1();
        let parent = doc(1, owner.as_str(), VisibilityTier::Shareable);

        assert!(
            validate_parent_assignment(&owner, VisibilityTier::Public, ParentCandidate::Unspecified)
                .is_ok()
        );
        assert!(matches!(
            validate_parent_assignment(&owner, VisibilityTier::Private, ParentCandidate::Missing),
            Err(PolicyError::BadRequest(_))
        ));
        assert!(
            validate_parent_assignment(
                &owner,
                VisibilityTier::Shareable,
                ParentCandidate::Found(&parent)
            )
            .is_ok()
        );
        assert!(matches!(
            validate_parent_assignment(&owner, VisibilityTier::Public, ParentCandidate::Found(&parent)),
            Err(PolicyError::BadRequest(_))
        ));
    }

    #[test]
    fn parent_candidate_from_lookup() {
        let parent = doc(1, "user1@example.com", VisibilityTier::Public);
        assert!(matches!(
            ParentCandidate::from_lookup(false, Some(&parent)),
            ParentCandidate::Unspecified
        ));
        assert!(matches!(
            ParentCandidate::from_lookup(true, None),
            ParentCandidate::Missing
        ));
        assert!(matches!(
            ParentCandidate::from_lookup(true, Some(&parent)),
            ParentCandidate::Found(_)
        ));
    }

    #[test]
    fn lowering_visibility_below_children_is_rejected() {
        let children = vec![
            doc(2, "user1@example.com", VisibilityTier::Private),
            doc(3, "user1@example.com", VisibilityTier::Public),
        ];
        assert!(validate_children_visibility(VisibilityTier::Public, &children).is_ok());
        let err = validate_children_visibility(VisibilityTier::Shareable, &children).unwrap_err();
        assert!(err.to_string().contains("public children"));
        assert!(validate_children_visibility(VisibilityTier::Invisible, &[]).is_ok());
    }

    #[test]
    fn reparenting_under_a_descendant_is_rejected() {
        let id = |raw| DocumentId::new(raw).unwrap();
        assert!(validate_no_cycle(id(1), &[id(2), id(3)]).is_ok());
        assert!(validate_no_cycle(id(1), &[id(2), id(1)]).is_err());
        assert!(validate_no_cycle(id(1), &[id(1)]).is_err());
    }

    proptest! {
        #[test]
        fn can_view_is_monotonic_in_visibility(
            low in any_tier(),
            high in any_tier(),
            viewer_is_owner in any::<bool>(),
            anonymous in any::<bool>(),
        ) {
            prop_assume!(low <= high);
            let owner = user1();
            let viewer = if viewer_is_owner { user1() } else { user2() };
            let principal = if anonymous { None } else { Some(&viewer) };

            if can_view(principal, &doc(1, owner.as_str(), low)) {
                prop_assert!(can_view(principal, &doc(1, owner.as_str(), high)));
            }
            if is_listable(principal, &doc(1, owner.as_str(), low)) {
                prop_assert!(is_listable(principal, &doc(1, owner.as_str(), high)));
            }
        }

        #[test]
        fn wider_child_than_parent_is_always_rejected(
            child in any_tier(),
            parent in any_tier(),
            same_owner in any::<bool>(),
        ) {
            prop_assume!(child > parent);
            let principal = user1();
            let owner = if same_owner { user1() } else { user2() };
            let parent = doc(1, owner.as_str(), parent);
            let result = validate_parent_assignment(&principal, child, ParentCandidate::Found(&parent));
            prop_assert!(matches!(result, Err(PolicyError::BadRequest(_))));
        }

        #[test]
        fn foreign_parent_is_always_rejected(child in any_tier(), parent in any_tier()) {
            let principal = user1();
            let parent = doc(1, user2().as_str(), parent);
            let result = validate_parent_assignment(&principal, child, ParentCandidate::Found(&parent));
            prop_assert!(matches!(result, Err(PolicyError::BadRequest(_))));
        }

        #[test]
        fn decisions_are_repeatable(tier in any_tier(), owner_matches in any::<bool>()) {
            let viewer = user1();
            let d = doc(1, if owner_matches { "user1@example.com" } else { "user2@example.com" }, tier);
            prop_assert_eq!(can_view(Some(&viewer), &d), can_view(Some(&viewer), &d));
            prop_assert_eq!(can_edit(Some(&viewer), &d), can_edit(Some(&viewer), &d));
            prop_assert_eq!(can_edit(Some(&viewer), &d), owner_matches);
        }
    }
}
