//! Display collaborator: where results and preview transforms end up.

use ml_core::ClassificationResult;

use crate::transform::AffineMatrix;

/// Fire-and-forget receiver for pipeline output.
///
/// Called from the inference worker and from view resize handling, so
/// implementations must not block for long.
pub trait DisplaySink: Send + Sync {
    fn publish_result(&self, result: &ClassificationResult);

    fn publish_transform(&self, transform: &AffineMatrix);
}
