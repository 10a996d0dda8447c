//! Incremental reconciliation of mutable sub-resources.
//!
//! Deltas are computed by pure functions so the decision of which calls to
//! issue can be tested without a remote side. Each `reconcile_*` method then
//! applies its delta with the narrowest calls the control plane offers.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tracing::{debug, info};

use super::{InstanceOrchestrator, InterfaceKey, poll_interface_attached, poll_interface_detached};
use super::{ATTACHED, ATTACHING, DETACHED, STILL_ATTACHED};
use crate::compute::{Cloud, InterfaceRequest, Microversion, ServerAction};
use crate::error::{LifecycleError, Step};
use crate::poll::StatusRefresh;

/// Additions and removals between two sets.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SetDelta<T> {
    /// Members of the new set missing from the old one.
    pub to_add: BTreeSet<T>,
    /// Members of the old set missing from the new one.
    pub to_remove: BTreeSet<T>,
}

impl<T> SetDelta<T>
where
    T: Ord + Clone,
{
    /// Computes `new - old` and `old - new`.
    #[must_use]
    pub fn between(old: &BTreeSet<T>, new: &BTreeSet<T>) -> Self {
        Self {
            to_add: new.difference(old).cloned().collect(),
            to_remove: old.difference(new).cloned().collect(),
        }
    }

    /// Returns `true` when the sets are equal.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Calls needed to move metadata from one map to another.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MetadataDelta {
    /// Keys to delete one by one.
    pub removed: BTreeSet<String>,
    /// Full map for the bulk upsert; empty when no upsert is needed.
    pub upsert: BTreeMap<String, String>,
}

impl MetadataDelta {
    /// Computes the delete-by-key and bulk-upsert calls for `old -> new`.
    #[must_use]
    pub fn between(old: &BTreeMap<String, String>, new: &BTreeMap<String, String>) -> Self {
        if old == new {
            return Self::default();
        }
        Self {
            removed: old
                .keys()
                .filter(|key| !new.contains_key(*key))
                .cloned()
                .collect(),
            upsert: new.clone(),
        }
    }

    /// Returns `true` when no call is needed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.upsert.is_empty()
    }
}

impl<C> InstanceOrchestrator<C>
where
    C: Cloud,
{
    /// Deletes removed metadata keys, then upserts the full new map.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Api`] when a call fails.
    pub async fn reconcile_metadata(
        &self,
        server_id: &str,
        old: &BTreeMap<String, String>,
        new: &BTreeMap<String, String>,
    ) -> Result<(), LifecycleError> {
        let delta = MetadataDelta::between(old, new);
        for key in &delta.removed {
            debug!(instance_id = server_id, key = %key, "deleting metadata key");
            self.cloud
                .delete_metadata_key(server_id, key)
                .await
                .map_err(|err| LifecycleError::api(server_id, Step::Metadata, err))?;
        }
        if !delta.upsert.is_empty() {
            self.cloud
                .update_metadata(server_id, &delta.upsert)
                .await
                .map_err(|err| LifecycleError::api(server_id, Step::Metadata, err))?;
        }
        Ok(())
    }

    /// Replaces the tag set when it changed.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Api`] when the replace call fails.
    pub async fn reconcile_tags(
        &self,
        server_id: &str,
        old: &BTreeSet<String>,
        new: &BTreeSet<String>,
    ) -> Result<(), LifecycleError> {
        if old == new {
            return Ok(());
        }
        self.cloud
            .replace_tags(server_id, new, Microversion::TAGS)
            .await
            .map_err(|err| LifecycleError::api(server_id, Step::Tags, err))?;
        Ok(())
    }

    /// Removes and adds security groups by name.
    ///
    /// Removing a group the instance no longer belongs to counts as success.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Api`] when a call fails.
    pub async fn reconcile_security_groups(
        &self,
        server_id: &str,
        old: &BTreeSet<String>,
        new: &BTreeSet<String>,
    ) -> Result<(), LifecycleError> {
        let delta = SetDelta::between(old, new);
        for name in delta.to_remove {
            let action = ServerAction::RemoveSecurityGroup { name };
            match self.cloud.server_action(server_id, &action).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {
                    debug!(instance_id = server_id, error = %err, "security group already removed");
                }
                Err(err) => return Err(LifecycleError::api(server_id, Step::SecurityGroups, err)),
            }
        }
        for name in delta.to_add {
            let action = ServerAction::AddSecurityGroup { name };
            self.cloud
                .server_action(server_id, &action)
                .await
                .map_err(|err| LifecycleError::api(server_id, Step::SecurityGroups, err))?;
        }
        Ok(())
    }

    /// Detaches ports that left the document and attaches new ones.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when a call or wait fails.
    pub async fn reconcile_ports(
        &self,
        server_id: &str,
        old: &BTreeSet<String>,
        new: &BTreeSet<String>,
        timeout: Duration,
    ) -> Result<(), LifecycleError> {
        let delta = SetDelta::between(old, new);
        for port_id in &delta.to_remove {
            self.detach_port(server_id, port_id, timeout).await?;
        }
        for port_id in &delta.to_add {
            self.attach_port(server_id, port_id, timeout).await?;
        }
        Ok(())
    }

    pub(super) async fn detach_port(
        &self,
        server_id: &str,
        port_id: &str,
        timeout: Duration,
    ) -> Result<(), LifecycleError> {
        info!(instance_id = server_id, port_id, "detaching port");
        match self.cloud.detach_interface(server_id, port_id).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(LifecycleError::api(server_id, Step::DetachPort, err)),
        }
        let refresh = StatusRefresh::new(
            &self.cloud,
            InterfaceKey::new(server_id, port_id),
            poll_interface_detached::<C>,
        );
        self.state_change(&[STILL_ATTACHED], &[DETACHED], timeout)
            .wait(&refresh)
            .await
            .map_err(|err| LifecycleError::from_wait(server_id, Step::DetachPort, err))
    }

    async fn attach_port(
        &self,
        server_id: &str,
        port_id: &str,
        timeout: Duration,
    ) -> Result<(), LifecycleError> {
        info!(instance_id = server_id, port_id, "attaching port");
        let request = InterfaceRequest {
            port_id: port_id.to_owned(),
        };
        self.cloud
            .attach_interface(server_id, &request)
            .await
            .map_err(|err| LifecycleError::api(server_id, Step::AttachPort, err))?;
        let refresh = StatusRefresh::new(
            &self.cloud,
            InterfaceKey::new(server_id, port_id),
            poll_interface_attached::<C>,
        );
        self.state_change(&[ATTACHING], &[ATTACHED], timeout)
            .wait(&refresh)
            .await
            .map_err(|err| LifecycleError::from_wait(server_id, Step::AttachPort, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|item| (*item).to_owned()).collect()
    }

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect()
    }

    #[test]
    fn set_delta_splits_additions_and_removals() {
        let delta = SetDelta::between(&set(&["a", "b", "c"]), &set(&["b", "c", "d"]));

        assert_eq!(delta.to_add, set(&["d"]));
        assert_eq!(delta.to_remove, set(&["a"]));
    }

    #[test]
    fn equal_sets_produce_empty_delta() {
        let delta = SetDelta::between(&set(&["a", "b"]), &set(&["b", "a"]));

        assert!(delta.is_empty());
    }

    #[test]
    fn metadata_delta_deletes_removed_keys_and_upserts_new_map() {
        let old = map(&[("foo", "bar"), ("abc", "def")]);
        let new = map(&[("foo", "bar"), ("ghi", "jkl")]);

        let delta = MetadataDelta::between(&old, &new);

        assert_eq!(delta.removed, set(&["abc"]));
        assert_eq!(delta.upsert, new);
    }

    #[test]
    fn unchanged_metadata_needs_no_calls() {
        let old = map(&[("foo", "bar")]);

        assert!(MetadataDelta::between(&old, &old.clone()).is_empty());
    }

    #[test]
    fn clearing_metadata_only_deletes() {
        let delta = MetadataDelta::between(&map(&[("foo", "bar")]), &BTreeMap::new());

        assert_eq!(delta.removed, set(&["foo"]));
        assert!(delta.upsert.is_empty());
    }
}
