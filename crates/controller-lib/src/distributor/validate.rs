//! Configuration document validation
//!
//! All rules run before a document is hashed or stored, so a rejected
//! document never produces a publish side effect.

use crate::error::{PipelineError, Result};
use crate::models::{CalibrationParams, CollectorConfig, EstimationServiceSpec, SinkDescriptor};
use crate::sink::parse_sink_uri;

fn validate_sink(field: &str, sink: &SinkDescriptor) -> Result<()> {
    parse_sink_uri(&sink.uri).map_err(|e| match e {
        // Unsupported schemes keep their own error kind; everything else
        // is reported as a validation failure on the named field.
        PipelineError::UnsupportedSink(_) => e,
        other => PipelineError::Validation(format!("{field}: {other}")),
    })?;

    if sink.database.is_empty() {
        return Err(PipelineError::Validation(format!(
            "{field}: database must not be empty"
        )));
    }
    if sink.collection.is_empty() {
        return Err(PipelineError::Validation(format!(
            "{field}: collection must not be empty"
        )));
    }

    Ok(())
}

fn validate_calibration(calibration: &CalibrationParams) -> Result<()> {
    if calibration.base_frequency_mhz == 0
        || calibration.min_frequency_mhz == 0
        || calibration.max_frequency_mhz == 0
    {
        return Err(PipelineError::Validation(
            "calibration frequencies must be positive".to_string(),
        ));
    }

    if calibration.min_frequency_mhz > calibration.base_frequency_mhz
        || calibration.base_frequency_mhz > calibration.max_frequency_mhz
    {
        return Err(PipelineError::Validation(format!(
            "calibration frequencies must satisfy min <= base <= max, got {} <= {} <= {}",
            calibration.min_frequency_mhz,
            calibration.base_frequency_mhz,
            calibration.max_frequency_mhz
        )));
    }

    if calibration.tdp_watts <= 0.0 {
        return Err(PipelineError::Validation(
            "tdp_watts must be positive".to_string(),
        ));
    }
    if calibration.error_threshold_watts <= 0.0 {
        return Err(PipelineError::Validation(
            "error_threshold_watts must be positive".to_string(),
        ));
    }
    if calibration.reference_event.is_empty() {
        return Err(PipelineError::Validation(
            "reference_event must not be empty".to_string(),
        ));
    }
    if calibration.min_samples == 0 {
        return Err(PipelineError::Validation(
            "min_samples must be positive".to_string(),
        ));
    }
    if calibration.history_window < calibration.min_samples {
        return Err(PipelineError::Validation(format!(
            "history_window ({}) must hold at least min_samples ({})",
            calibration.history_window, calibration.min_samples
        )));
    }

    Ok(())
}

/// Validate a fleet-wide collector configuration.
pub fn validate_collector(config: &CollectorConfig) -> Result<()> {
    if config.sampling_frequency_hz == 0 {
        return Err(PipelineError::Validation(
            "sampling_frequency_hz must be positive".to_string(),
        ));
    }

    if config.system_events.is_empty() && config.container_events.is_empty() {
        return Err(PipelineError::Validation(
            "at least one event counter must be enabled".to_string(),
        ));
    }

    validate_sink("sink", &config.sink)
}

/// Validate an estimation service configuration.
pub fn validate_estimation(spec: &EstimationServiceSpec) -> Result<()> {
    validate_sink("input", &spec.input)?;

    if spec.outputs.is_empty() {
        return Err(PipelineError::Validation(
            "at least one output sink is required".to_string(),
        ));
    }
    if spec.outputs.len() > 1 && !spec.multiplex {
        return Err(PipelineError::Validation(format!(
            "{} output sinks configured but multiplexing is not enabled",
            spec.outputs.len()
        )));
    }
    for (i, output) in spec.outputs.iter().enumerate() {
        validate_sink(&format!("outputs[{i}]"), output)?;
    }

    if spec.sampling_interval_ms == 0 {
        return Err(PipelineError::Validation(
            "sampling_interval_ms must be positive".to_string(),
        ));
    }

    validate_calibration(&spec.calibration)
}
