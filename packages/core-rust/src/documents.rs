//! Inbound document types and the discriminator-to-workflow mapping.
//!
//! Every inbound message carries a document-type discriminator. The mapping
//! from discriminator to workflow name is explicit configuration: the
//! defaults below cover the document types the router ships builders for,
//! and deployments can add or override entries without code changes as long
//! as the target workflow is registered.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::names::WorkflowName;

/// Workflow names of the document-type sub-workflows.
pub mod sub_workflows {
    pub const SN: &str = "sn-sub-orchestrator";
    pub const OBASN: &str = "obasn-sub-orchestrator";
    pub const WO_STATUS: &str = "wo-status-sub-orchestrator";
    pub const WO_ACK: &str = "wo-ack-sub-orchestrator";
    pub const WO_CHANGE_ACK: &str = "wo-change-ack-sub-orchestrator";
    pub const IBASN_ACK: &str = "ibasn-ack-sub-orchestrator";
    pub const IBASN_RECEIPT: &str = "ibasn-receipt-sub-orchestrator";
    pub const NF: &str = "nf-sub-orchestrator";
    pub const CROSS_DOCK: &str = "cross-dock-sub-orchestrator";
    pub const CROSS_DOCK_WO_ACK: &str = "cross-dock-wo-ack-sub-orchestrator";
    pub const REVERSE_MANIFEST: &str = "reverse-manifest-sub-orchestrator";
}

/// Document types with a dedicated sub-workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentType {
    /// Shipment notice.
    Sn,
    /// Outbound advance shipment notice.
    ObAsn,
    /// Work-order status.
    WoStatus,
    /// Work-order acknowledgement.
    WoAck,
    /// Work-order change acknowledgement.
    WoChangeAck,
    /// Inbound ASN ack / nack.
    IbAsnAck,
    /// Inbound ASN receipt.
    IbAsnReceipt,
    /// Notification feed.
    Nf,
    /// Cross-dock instruction.
    CrossDock,
    /// Cross-dock work-order acknowledgement.
    CrossDockWoAck,
    /// Reverse-logistics manifest.
    ReverseManifest,
}

impl DocumentType {
    /// All document types, in a stable order.
    pub const ALL: [DocumentType; 11] = [
        DocumentType::Sn,
        DocumentType::ObAsn,
        DocumentType::WoStatus,
        DocumentType::WoAck,
        DocumentType::WoChangeAck,
        DocumentType::IbAsnAck,
        DocumentType::IbAsnReceipt,
        DocumentType::Nf,
        DocumentType::CrossDock,
        DocumentType::CrossDockWoAck,
        DocumentType::ReverseManifest,
    ];

    /// Discriminator value carried by inbound messages of this type.
    #[must_use]
    pub fn discriminator(self) -> &'static str {
        match self {
            DocumentType::Sn => "SN",
            DocumentType::ObAsn => "OBASN",
            DocumentType::WoStatus => "WOSS",
            DocumentType::WoAck => "WOACK",
            DocumentType::WoChangeAck => "WOCHANGEACK",
            DocumentType::IbAsnAck => "IBASNACK",
            DocumentType::IbAsnReceipt => "IBASNRECEIPT",
            DocumentType::Nf => "NF",
            DocumentType::CrossDock => "CROSSDOCK",
            DocumentType::CrossDockWoAck => "CROSSDOCKWOACK",
            DocumentType::ReverseManifest => "REVERSEMANIFEST",
        }
    }

    /// Name of the sub-workflow that processes this document type.
    #[must_use]
    pub fn sub_workflow(self) -> &'static str {
        match self {
            DocumentType::Sn => sub_workflows::SN,
            DocumentType::ObAsn => sub_workflows::OBASN,
            DocumentType::WoStatus => sub_workflows::WO_STATUS,
            DocumentType::WoAck => sub_workflows::WO_ACK,
            DocumentType::WoChangeAck => sub_workflows::WO_CHANGE_ACK,
            DocumentType::IbAsnAck => sub_workflows::IBASN_ACK,
            DocumentType::IbAsnReceipt => sub_workflows::IBASN_RECEIPT,
            DocumentType::Nf => sub_workflows::NF,
            DocumentType::CrossDock => sub_workflows::CROSS_DOCK,
            DocumentType::CrossDockWoAck => sub_workflows::CROSS_DOCK_WO_ACK,
            DocumentType::ReverseManifest => sub_workflows::REVERSE_MANIFEST,
        }
    }

    /// Parses a discriminator (trimmed, case-insensitive).
    #[must_use]
    pub fn from_discriminator(value: &str) -> Option<Self> {
        let value = value.trim();
        Self::ALL
            .into_iter()
            .find(|doc| doc.discriminator().eq_ignore_ascii_case(value))
    }
}

/// What to do with a present discriminator that has no mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownDocumentPolicy {
    /// Route to the primary workflow.
    #[default]
    RouteToPrimary,
    /// Dispatch under the raw discriminator so it fails as an unknown workflow.
    Reject,
}

/// Result of resolving a discriminator against a [`DiscriminatorMap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The discriminator is mapped to this workflow.
    Mapped(WorkflowName),
    /// No discriminator was present (or it was blank).
    Absent,
    /// A discriminator was present but has no mapping.
    Unmapped(String),
}

/// Explicit mapping from discriminator value to workflow name.
///
/// Keys are stored upper-cased; lookups trim and upper-case the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscriminatorMap {
    entries: BTreeMap<String, WorkflowName>,
}

impl DiscriminatorMap {
    /// An empty map. Every present discriminator resolves as unmapped.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Default mapping extended (or overridden) by the given entries.
    #[must_use]
    pub fn with_overrides<'a>(overrides: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut map = Self::default();
        for (discriminator, workflow) in overrides {
            map.insert(discriminator, WorkflowName::from(workflow));
        }
        map
    }

    /// Inserts or replaces a mapping.
    pub fn insert(&mut self, discriminator: &str, workflow: WorkflowName) {
        self.entries
            .insert(discriminator.trim().to_ascii_uppercase(), workflow);
    }

    /// Resolves an optional discriminator.
    #[must_use]
    pub fn resolve(&self, discriminator: Option<&str>) -> Resolution {
        let Some(raw) = discriminator.map(str::trim).filter(|d| !d.is_empty()) else {
            return Resolution::Absent;
        };
        match self.entries.get(&raw.to_ascii_uppercase()) {
            Some(workflow) => Resolution::Mapped(workflow.clone()),
            None => Resolution::Unmapped(raw.to_string()),
        }
    }

    /// Workflow names this map can resolve to, deduplicated.
    #[must_use]
    pub fn targets(&self) -> Vec<&WorkflowName> {
        let mut targets: Vec<&WorkflowName> = self.entries.values().collect();
        targets.sort();
        targets.dedup();
        targets
    }

    /// Number of discriminators in the map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the map has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DiscriminatorMap {
    fn default() -> Self {
        let mut map = Self::empty();
        for doc in DocumentType::ALL {
            map.insert(doc.discriminator(), WorkflowName::from(doc.sub_workflow()));
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_map_covers_every_document_type() {
        let map = DiscriminatorMap::default();
        assert_eq!(map.len(), DocumentType::ALL.len());
        for doc in DocumentType::ALL {
            assert_eq!(
                map.resolve(Some(doc.discriminator())),
                Resolution::Mapped(WorkflowName::from(doc.sub_workflow()))
            );
        }
    }

    #[test]
    fn lookup_is_trimmed_and_case_insensitive() {
        let map = DiscriminatorMap::default();
        assert_eq!(
            map.resolve(Some("  sn ")),
            Resolution::Mapped(WorkflowName::from(sub_workflows::SN))
        );
    }

    #[test]
    fn absent_and_blank_discriminators_resolve_absent() {
        let map = DiscriminatorMap::default();
        assert_eq!(map.resolve(None), Resolution::Absent);
        assert_eq!(map.resolve(Some("   ")), Resolution::Absent);
    }

    #[test]
    fn unknown_discriminator_is_unmapped() {
        let map = DiscriminatorMap::default();
        assert_eq!(
            map.resolve(Some("UNKNOWN_TYPE")),
            Resolution::Unmapped("UNKNOWN_TYPE".to_string())
        );
    }

    #[test]
    fn overrides_replace_and_extend_defaults() {
        let map = DiscriminatorMap::with_overrides([
            ("SN", "custom-sn"),
            ("INVOICE", "invoice-sub-orchestrator"),
        ]);
        assert_eq!(
            map.resolve(Some("SN")),
            Resolution::Mapped(WorkflowName::from("custom-sn"))
        );
        assert_eq!(
            map.resolve(Some("invoice")),
            Resolution::Mapped(WorkflowName::from("invoice-sub-orchestrator"))
        );
        assert_eq!(map.len(), DocumentType::ALL.len() + 1);
    }

    #[test]
    fn document_type_round_trips_through_discriminator() {
        for doc in DocumentType::ALL {
            assert_eq!(DocumentType::from_discriminator(doc.discriminator()), Some(doc));
        }
        assert_eq!(DocumentType::from_discriminator("woss"), Some(DocumentType::WoStatus));
        assert_eq!(DocumentType::from_discriminator("nope"), None);
    }

    #[test]
    fn targets_are_deduplicated() {
        let map = DiscriminatorMap::with_overrides([("ALIAS-SN", sub_workflows::SN)]);
        let targets = map.targets();
        assert_eq!(targets.len(), DocumentType::ALL.len());
    }
}
