//! Translation of MongoDB driver errors into [`DriverError`].
//!
//! This is the only place that looks inside `mongodb::error::Error`.

use mongodb::bson::{Bson, Document};
use mongodb::error::{Error, ErrorKind, WriteFailure};

use crate::classification::{DriverError, DriverErrorKind, FieldError};
use crate::error::ResilienceError;

/// Server code for a document failing collection validation
const DOCUMENT_VALIDATION_FAILURE: i32 = 121;

impl From<Error> for DriverError {
    fn from(error: Error) -> Self {
        let message = error.to_string();
        let labels: Vec<String> = error.labels().iter().cloned().collect();

        let mut driver = match error.kind.as_ref() {
            ErrorKind::Command(command) => DriverError::command(command.code, command.message.clone())
                .with_code_name(command.code_name.clone()),
            ErrorKind::Write(WriteFailure::WriteError(write)) => {
                let mut driver = DriverError::new(DriverErrorKind::Write, write.message.clone())
                    .with_code(write.code);
                if let Some(name) = &write.code_name {
                    driver = driver.with_code_name(name.clone());
                }
                if write.code == DOCUMENT_VALIDATION_FAILURE {
                    if let Some(details) = &write.details {
                        driver.field_errors = validation_field_errors(details);
                    }
                }
                driver
            }
            ErrorKind::Write(WriteFailure::WriteConcernError(concern)) => {
                DriverError::new(DriverErrorKind::Write, concern.message.clone())
                    .with_code(concern.code)
                    .with_code_name(concern.code_name.clone())
            }
            ErrorKind::Authentication { .. } => DriverError::new(DriverErrorKind::Authentication, message),
            ErrorKind::ServerSelection { .. } => DriverError::new(DriverErrorKind::ServerSelection, message),
            ErrorKind::ConnectionPoolCleared { .. } | ErrorKind::DnsResolve { .. } => {
                DriverError::network(message)
            }
            ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => DriverError::timeout(message),
            ErrorKind::Io(_) => DriverError::new(DriverErrorKind::Io, message),
            ErrorKind::InvalidArgument { .. } => DriverError::new(DriverErrorKind::InvalidArgument, message),
            ErrorKind::BsonSerialization(_) | ErrorKind::BsonDeserialization(_) => {
                DriverError::new(DriverErrorKind::Validation, message)
            }
            _ => DriverError::new(DriverErrorKind::Other, message),
        };

        driver.labels = labels;
        driver
    }
}

impl From<Error> for ResilienceError {
    fn from(error: Error) -> Self {
        ResilienceError::Driver(error.into())
    }
}

/// Pull per-property failures out of a validation error's `errInfo`.
///
/// The server nests them under
/// `details.schemaRulesNotSatisfied[].propertiesNotSatisfied[]`.
fn validation_field_errors(details: &Document) -> Vec<FieldError> {
    let Ok(rules) = details.get_array("schemaRulesNotSatisfied") else {
        return Vec::new();
    };

    rules
        .iter()
        .filter_map(Bson::as_document)
        .filter_map(|rule| rule.get_array("propertiesNotSatisfied").ok())
        .flatten()
        .filter_map(Bson::as_document)
        .filter_map(|property| {
            let field = property.get_str("propertyName").ok()?;
            let message = property
                .get_str("description")
                .map(str::to_string)
                .unwrap_or_else(|_| "failed schema validation".to_string());
            Some(FieldError::new(field, message))
        })
        .collect()
}
