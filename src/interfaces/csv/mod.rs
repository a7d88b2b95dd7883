pub mod validation_report;
