pub mod false_positive;
pub mod min_severity;
