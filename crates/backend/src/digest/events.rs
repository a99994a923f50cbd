use serde::Serialize;

use crate::domain::digest::DigestStatus;

/// Advisory notice that a digester finished for a path.
///
/// Published on a broadcast channel; delivery is best-effort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DigestEvent {
  pub path: String,
  /// Output name
  pub digester: String,
  pub status: DigestStatus,
}
