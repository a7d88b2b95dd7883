use crate::application::dlq::MessageValidation;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct ValidationRow<'a> {
    message_id: &'a str,
    original_routing_key: &'a str,
    dead_letter_reason: &'a str,
    valid: bool,
    issues: String,
}

/// Writes DLQ validation results as CSV, one row per message.
///
/// Wraps `csv::Writer`; issues are joined into a single `;`-separated column.
pub struct ValidationReportWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> ValidationReportWriter<W> {
    pub fn new(sink: W) -> Self {
        let writer = csv::WriterBuilder::new().from_writer(sink);
        Self { writer }
    }

    pub fn write_results(&mut self, results: &[MessageValidation]) -> Result<()> {
        for result in results {
            self.writer.serialize(ValidationRow {
                message_id: &result.message_id,
                original_routing_key: result.original_routing_key.as_deref().unwrap_or(""),
                dead_letter_reason: result.dead_letter_reason.as_deref().unwrap_or(""),
                valid: result.valid,
                issues: result.issues.join("; "),
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
