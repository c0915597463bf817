use std::fmt;

/// Lifecycle of one tracked file.
///
/// Only `Created` and `Updated` become `Same` after the next unchanged
/// check; a negative status is never silently downgraded to `Same`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceStatus {
    Created,
    Updated,
    Deleted,
    FailedToCreate,
    FailedToUpdate,
    Same,
}

impl ResourceStatus {
    /// The file itself just changed (including deletion).
    pub fn was_updated(self) -> bool {
        matches!(
            self,
            ResourceStatus::Created | ResourceStatus::Updated | ResourceStatus::Deleted
        )
    }

    /// A usable value is available under this status.
    pub fn has_resource(self) -> bool {
        matches!(
            self,
            ResourceStatus::Created
                | ResourceStatus::Updated
                | ResourceStatus::FailedToUpdate
                | ResourceStatus::Same
        )
    }

    /// The failure counterpart of an attempt status.
    pub fn failed(self) -> ResourceStatus {
        match self {
            ResourceStatus::Created => ResourceStatus::FailedToCreate,
            ResourceStatus::Updated => ResourceStatus::FailedToUpdate,
            other => other,
        }
    }

    /// Fold a newly observed status into the sticky one. `Same` only
    /// replaces a predecessor that both was updated and has a resource.
    pub fn merge(self, new: ResourceStatus) -> ResourceStatus {
        match new {
            ResourceStatus::Same => {
                if self.was_updated() && self.has_resource() {
                    ResourceStatus::Same
                } else {
                    self
                }
            }
            other => other,
        }
    }

    /// Fold one referenced file's check result into the dependent's own:
    /// a changed reference promotes an otherwise unchanged dependent to
    /// `Updated`, so a cluster never reports `Same` when anything in it
    /// changed.
    pub fn combine_ref(self, ref_status: ResourceStatus) -> ResourceStatus {
        if self == ResourceStatus::Same
            && matches!(ref_status, ResourceStatus::Created | ResourceStatus::Updated)
        {
            ResourceStatus::Updated
        } else {
            self
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceStatus::Created => "created",
            ResourceStatus::Updated => "updated",
            ResourceStatus::Deleted => "deleted",
            ResourceStatus::FailedToCreate => "failed_to_create",
            ResourceStatus::FailedToUpdate => "failed_to_update",
            ResourceStatus::Same => "same",
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::ResourceStatus::*;

    #[test]
    fn flags() {
        assert!(Created.was_updated() && Created.has_resource());
        assert!(Updated.was_updated() && Updated.has_resource());
        assert!(Deleted.was_updated() && !Deleted.has_resource());
        assert!(!FailedToCreate.was_updated() && !FailedToCreate.has_resource());
        assert!(!FailedToUpdate.was_updated() && FailedToUpdate.has_resource());
        assert!(!Same.was_updated() && Same.has_resource());
    }

    #[test]
    fn same_never_overrides_negative_outcomes() {
        assert_eq!(Created.merge(Same), Same);
        assert_eq!(Updated.merge(Same), Same);
        assert_eq!(Deleted.merge(Same), Deleted);
        assert_eq!(FailedToCreate.merge(Same), FailedToCreate);
        assert_eq!(FailedToUpdate.merge(Same), FailedToUpdate);
        assert_eq!(Same.merge(Updated), Updated);
        assert_eq!(Deleted.merge(Created), Created);
    }

    #[test]
    fn failed_maps_attempts_only() {
        assert_eq!(Created.failed(), FailedToCreate);
        assert_eq!(Updated.failed(), FailedToUpdate);
        assert_eq!(Same.failed(), Same);
        assert_eq!(Deleted.failed(), Deleted);
    }

    #[test]
    fn changed_reference_promotes_same_dependent() {
        assert_eq!(Same.combine_ref(Updated), Updated);
        assert_eq!(Same.combine_ref(Created), Updated);
        assert_eq!(Same.combine_ref(Same), Same);
        assert_eq!(Same.combine_ref(Deleted), Same);
        assert_eq!(Created.combine_ref(Updated), Created);
    }
}
