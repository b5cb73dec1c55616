use crate::answer::Answer;
use crate::status::{ErrorCode, OperationStatus};
use crate::types::{CoordTransactionId, OperationId};

/// Snapshot of one tracked operation.
///
/// Returned by `enquire`, `wait`, the sync bridge, and handed to completion
/// callbacks. Destination fields are filled by the resolver; `shard_id` and
/// `server_id` stay empty for raw endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    pub operation_id: OperationId,
    pub coord_transaction_id: CoordTransactionId,
    pub shard_id: String,
    pub server_id: String,
    pub endpoint: String,
    pub status: OperationStatus,
    /// Set for `Error`/`BackendUnavailable`; see [`OperationResult::error_code`].
    pub error_code: ErrorCode,
    pub error_message: String,
    /// Present only when `status == Received`.
    pub answer: Option<Answer>,
    /// `true` when exactly one reply is expected for this request.
    pub single: bool,
    /// Whether the request bytes were fully written before a failure.
    pub send_was_complete: bool,
}

impl OperationResult {
    /// Creates a fresh `Submitted` result with no destination.
    #[must_use]
    pub fn new(operation_id: OperationId, coord_transaction_id: CoordTransactionId) -> Self {
        Self {
            operation_id,
            coord_transaction_id,
            shard_id: String::new(),
            server_id: String::new(),
            endpoint: String::new(),
            status: OperationStatus::Submitted,
            error_code: ErrorCode::NO_ERROR,
            error_message: String::new(),
            answer: None,
            single: true,
            send_was_complete: false,
        }
    }

    /// Synthesized result for an operation that is not (or no longer) tracked.
    #[must_use]
    pub fn dropped(
        operation_id: OperationId,
        coord_transaction_id: CoordTransactionId,
        shard_id: &str,
    ) -> Self {
        let mut result = Self::new(operation_id, coord_transaction_id);
        result.shard_id = shard_id.to_string();
        result.status = OperationStatus::Dropped;
        result
    }

    /// Numeric error code derived from the status.
    ///
    /// `Received`/`Submitted`/`Sending`/`Sent` map to no error, `Timeout` to
    /// `CLUSTER_TIMEOUT`, `BackendUnavailable` to `CLUSTER_BACKEND_UNAVAILABLE`,
    /// and `Error`/`Dropped` to the stored code or `INTERNAL` when unset.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self.status {
            OperationStatus::Received
            | OperationStatus::Submitted
            | OperationStatus::Sending
            | OperationStatus::Sent => ErrorCode::NO_ERROR,
            OperationStatus::Timeout => ErrorCode::CLUSTER_TIMEOUT,
            OperationStatus::BackendUnavailable => ErrorCode::CLUSTER_BACKEND_UNAVAILABLE,
            OperationStatus::Error | OperationStatus::Dropped => {
                if self.error_code.is_error() {
                    self.error_code
                } else {
                    ErrorCode::INTERNAL
                }
            }
        }
    }

    /// Returns `true` once no further mutation is permitted.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Status code of the received answer, if any.
    #[must_use]
    pub fn answer_code(&self) -> Option<u16> {
        self.answer.as_ref().map(|answer| answer.status_code)
    }

    /// Marks the result as a failure with the given status, code and message.
    pub fn fail(&mut self, status: OperationStatus, code: ErrorCode, message: impl Into<String>) {
        self.status = status;
        self.error_code = code;
        self.error_message = message.into();
        self.answer = None;
    }

    /// Stores a received answer and marks the result `Received`.
    pub fn receive(&mut self, answer: Answer) {
        self.status = OperationStatus::Received;
        self.error_code = ErrorCode::NO_ERROR;
        self.error_message.clear();
        self.send_was_complete = true;
        self.answer = Some(answer);
    }
}
