use serde::{Deserialize, Serialize};

use crate::ids::{CollectionId, ImageId};

/// Domain events carry ids only; handlers look the aggregates back up
/// through repositories instead of following in-memory pointers. Producers
/// buffer events explicitly and hand the buffer to the invalidation path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    /// The source image changed or disappeared; every derived artifact for
    /// it must be dropped from all cache tiers.
    ImageInvalidated { image_id: ImageId },
    /// A collection was soft-deleted. Its artifacts stay on disk until a
    /// purge pass, but the memory and shared tiers drop their entries.
    CollectionDeleted { collection_id: CollectionId },
}
