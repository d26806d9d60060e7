use std::sync::{Arc, Mutex};

use beacon_req_resp::RequestHandler;
use beacon_ssz::Value;
use beacon_wire::{
    codec::ResponseChunk, BlobIdentifier, ContentKey, ForkName, MessageType, PeerId, RequestBody,
    ResponseCode, Root, SchemaRegistry, VersionedValidatorChange,
};

struct StoredBlock {
    fork: ForkName,
    value: Value,
    root: Root,
    slot: u64,
}

struct StoredBlob {
    value: Value,
    id: BlobIdentifier,
    slot: u64,
}

/// The data a mock peer serves.
pub struct MockStore {
    registry: Arc<SchemaRegistry>,
    blocks: Vec<StoredBlock>,
    blobs: Vec<StoredBlob>,
    changes: Mutex<Vec<VersionedValidatorChange>>,
}

impl MockStore {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            registry,
            blocks: Vec::new(),
            blobs: Vec::new(),
            changes: Mutex::new(Vec::new()),
        }
    }

    /// Adds a signed block of `fork`.
    ///
    /// # Panics
    ///
    /// Panics if `value` is not a block of `fork`.
    #[must_use]
    pub fn with_block(mut self, fork: ForkName, value: Value) -> Self {
        let ContentKey::Root(root) = self
            .registry
            .item_key(MessageType::BlocksByRoot, fork, &value)
            .unwrap()
        else {
            panic!("block key is not a root");
        };
        let slot = value.field(0).and_then(|m| m.field(0)).and_then(Value::as_uint).unwrap();

        self.blocks.push(StoredBlock {
            fork,
            value,
            root,
            slot,
        });
        self
    }

    /// Adds a blob sidecar.
    ///
    /// # Panics
    ///
    /// Panics if `value` is not a blob sidecar.
    #[must_use]
    pub fn with_blob_sidecar(mut self, value: Value) -> Self {
        let ContentKey::Blob(id) = self
            .registry
            .item_key(MessageType::BlobSidecarsByRoot, ForkName::Deneb, &value)
            .unwrap()
        else {
            panic!("blob key is not an identifier");
        };
        let Some(ContentKey::SlotIndex { slot, .. }) = self
            .registry
            .item_key(MessageType::BlobSidecarsByRange, ForkName::Deneb, &value)
            .ok()
        else {
            panic!("blob range key is not a slot and index");
        };

        self.blobs.push(StoredBlob { value, id, slot });
        self
    }

    /// The validator changes broadcast to this store.
    pub fn received_changes(&self) -> Vec<VersionedValidatorChange> {
        self.changes.lock().unwrap().clone()
    }

    fn items(&self, request: RequestBody) -> Vec<(ForkName, Value)> {
        match request {
            RequestBody::BlocksByRoot(roots) => roots
                .iter()
                .filter_map(|root| self.blocks.iter().find(|b| &b.root == root))
                .map(|b| (b.fork, b.value.clone()))
                .collect(),
            RequestBody::BlocksByRange(range) => {
                let mut blocks = self
                    .blocks
                    .iter()
                    .filter(|b| range.contains(b.slot))
                    .collect::<Vec<_>>();
                blocks.sort_by_key(|b| b.slot);
                blocks.into_iter().map(|b| (b.fork, b.value.clone())).collect()
            }
            RequestBody::BlobSidecarsByRoot(ids) => ids
                .iter()
                .filter_map(|id| self.blobs.iter().find(|b| &b.id == id))
                .map(|b| (ForkName::Deneb, b.value.clone()))
                .collect(),
            RequestBody::BlobSidecarsByRange(range) => {
                let mut blobs = self
                    .blobs
                    .iter()
                    .filter(|b| range.contains(b.slot))
                    .collect::<Vec<_>>();
                blobs.sort_by_key(|b| (b.slot, b.id.index));
                blobs
                    .into_iter()
                    .map(|b| (ForkName::Deneb, b.value.clone()))
                    .collect()
            }
            RequestBody::ValidatorChangeBroadcast(changes) => {
                self.changes.lock().unwrap().extend(changes);
                Vec::new()
            }
        }
    }
}

#[async_trait::async_trait]
impl<P: PeerId> RequestHandler<P> for MockStore {
    async fn handle(&self, _peer: &P, request: RequestBody) -> Vec<ResponseChunk> {
        let message_type = request.message_type();
        let items = self.items(request);

        if items.is_empty() && !self.registry.policy(message_type).allow_empty_response {
            return vec![ResponseChunk::Error {
                code: ResponseCode::ResourceUnavailable,
                message: "not found".to_string(),
            }];
        }

        items
            .into_iter()
            .map(|(fork, value)| ResponseChunk::Success { fork, value })
            .collect()
    }
}
