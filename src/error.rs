// Typed error conditions layered under the anyhow-based top level.
//
// Setup and per-frame failures unwind as plain anyhow errors and terminate
// the run. The types below are the conditions callers are expected to catch
// (or at least tell apart) via `Error::downcast_ref`.

use ash::vk;
use thiserror::Error;

/// Pool ran out of declared capacity. Recoverable: the caller may grow a
/// pool or fail the single operation; pool bookkeeping stays intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CapacityError {
    #[error(
        "descriptor pool exhausted: {allocated} of {capacity} sets issued, {requested} more requested"
    )]
    DescriptorPool {
        capacity: u32,
        allocated: u32,
        requested: u32,
    },
}

/// A generation-checked id resolved after its slot was freed or its pool
/// reset. Detected instead of silently aliasing a recycled object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stale {kind} id {index}: slot was freed or pool was reset")]
pub struct StaleHandle {
    pub kind: &'static str,
    pub index: u32,
}

/// Image layout transition pair outside the supported table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unsupported image layout transition: {from:?} -> {to:?}")]
pub struct UnsupportedTransition {
    pub from: vk::ImageLayout,
    pub to: vk::ImageLayout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_error_is_downcastable_from_anyhow() {
        let source = CapacityError::DescriptorPool {
            capacity: 4,
            allocated: 4,
            requested: 1,
        };
        let err = anyhow::Error::from(source);
        assert_eq!(err.downcast_ref::<CapacityError>(), Some(&source));
    }

    #[test]
    fn stale_handle_keeps_kind_and_index() {
        let err = anyhow::Error::from(StaleHandle {
            kind: "fence",
            index: 3,
        });
        let stale = err.downcast_ref::<StaleHandle>().unwrap();
        assert_eq!(stale.kind, "fence");
        assert_eq!(stale.index, 3);
    }
}
