//! Administrative alerts raised when a message is quarantined.

use tracing::error;

/// Everything an operator needs to triage one quarantined message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoisonAlert {
    pub operation: String,
    pub correlation_id: String,
    pub reason: String,
    pub retry_count: u32,
    /// Payload text cut to the configured preview length.
    pub payload_preview: String,
}

impl PoisonAlert {
    /// One-line alert text, also stamped on the poisoned envelope.
    pub fn message(&self) -> String {
        format!(
            "{} message {} quarantined after {} retries: {}",
            self.operation, self.correlation_id, self.retry_count, self.reason
        )
    }
}

/// Lossy UTF-8 rendering of `payload`, at most `max_chars` characters plus
/// an ellipsis marker when cut.
pub fn payload_preview(payload: &[u8], max_chars: usize) -> String {
    let text = String::from_utf8_lossy(payload);
    if text.chars().count() <= max_chars {
        return text.into_owned();
    }
    let mut preview: String = text.chars().take(max_chars).collect();
    preview.push_str("...");
    preview
}

/// Receives poison alerts.
pub trait AlertSink: Send + Sync {
    fn alert(&self, alert: &PoisonAlert);
}

/// Emits alerts as structured `error!` log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn alert(&self, alert: &PoisonAlert) {
        error!(
            operation = %alert.operation,
            correlation_id = %alert.correlation_id,
            retry_count = alert.retry_count,
            reason = %alert.reason,
            payload_preview = %alert.payload_preview,
            "ALERT: message quarantined to poison target"
        );
    }
}
