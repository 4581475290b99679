use color_eyre::eyre::Report;
use thiserror::Error;

/// The two failure families the renderer can produce. Neither is recoverable
/// at the call site; both are carried up to the caller inside an `eyre::Report`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// Content or programming error: unsupported format combination, unknown
    /// material parameter, missing vertex attribute, misuse of the pass state machine.
    #[error("configuration error in {operation}: {details}")]
    Configuration {
        operation: &'static str,
        details: String,
    },

    /// A backend call returned something other than success.
    #[error("driver error in {operation}: {details}")]
    Driver {
        operation: &'static str,
        details: String,
    },
}

impl RenderError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    pub fn is_driver(&self) -> bool {
        matches!(self, Self::Driver { .. })
    }

    pub fn operation(&self) -> &'static str {
        match self {
            Self::Configuration { operation, .. } | Self::Driver { operation, .. } => operation,
        }
    }
}

pub fn configuration_error(operation: &'static str, details: impl Into<String>) -> Report {
    let err = RenderError::Configuration {
        operation,
        details: details.into(),
    };
    log::error!("{}", err);
    Report::new(err)
}

pub fn driver_error(operation: &'static str, details: impl Into<String>) -> Report {
    let err = RenderError::Driver {
        operation,
        details: details.into(),
    };
    log::error!("{}", err);
    Report::new(err)
}

/// Maps any displayable backend failure into a driver error for `operation`.
pub trait DriverResultExt<T> {
    fn driver_err(self, operation: &'static str) -> color_eyre::Result<T>;
}

impl<T, E: std::fmt::Display> DriverResultExt<T> for Result<T, E> {
    fn driver_err(self, operation: &'static str) -> color_eyre::Result<T> {
        self.map_err(|e| driver_error(operation, e.to_string()))
    }
}

/// Returns the renderer error category carried by `report`, if any.
pub fn classify(report: &Report) -> Option<&RenderError> {
    report.downcast_ref::<RenderError>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_keep_their_category() {
        let report = configuration_error("set_param", "unknown parameter `tint`");
        let err = classify(&report).unwrap();
        assert!(err.is_configuration());
        assert_eq!(err.operation(), "set_param");
        assert_eq!(
            report.to_string(),
            "configuration error in set_param: unknown parameter `tint`"
        );
    }

    #[test]
    fn driver_results_are_wrapped() {
        let result: Result<(), &str> = Err("VK_ERROR_DEVICE_LOST");
        let report = result.driver_err("submit").unwrap_err();
        assert!(classify(&report).unwrap().is_driver());
    }
}
