//! Converters between proto types and domain types.

use chrono::Utc;
use thiserror::Error;

use crate::pb;
use crate::pb::envelope::Payload;
use pipeflow_core::{
    DatasetHandle, DatasetRef, FailureDiagnostic, Rank, RunId, StepSpec, UnitId, UnitOutcome,
};

/// Errors turning wire messages into domain values.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value {value} for {field}")]
    InvalidEnum { field: &'static str, value: i32 },

    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}

// ============================================================================
// Envelope helpers
// ============================================================================

impl pb::Envelope {
    pub fn new(source: Rank, target: Rank, payload: Payload) -> Self {
        Self {
            source: source.get(),
            target: target.get(),
            payload: Some(payload),
        }
    }

    pub fn source_rank(&self) -> Rank {
        Rank::new(self.source)
    }

    pub fn target_rank(&self) -> Rank {
        Rank::new(self.target)
    }

    /// Short payload name for logs.
    pub fn kind(&self) -> &'static str {
        match &self.payload {
            Some(Payload::Hello(_)) => "hello",
            Some(Payload::Heartbeat(_)) => "heartbeat",
            Some(Payload::Assign(_)) => "assign",
            Some(Payload::Cancel(_)) => "cancel",
            Some(Payload::Shutdown(_)) => "shutdown",
            Some(Payload::Report(_)) => "report",
            None => "empty",
        }
    }
}

// ============================================================================
// StepSpec conversions
// ============================================================================

impl From<StepSpec> for pb::StepSpec {
    fn from(step: StepSpec) -> Self {
        pb::StepSpec {
            id: step.id.into_inner(),
            inputs: step.inputs.into_iter().map(DatasetRef::into_inner).collect(),
            outputs: step.outputs.into_iter().map(DatasetRef::into_inner).collect(),
            params: step.params,
        }
    }
}

impl From<pb::StepSpec> for StepSpec {
    fn from(proto: pb::StepSpec) -> Self {
        StepSpec {
            id: proto.id.into(),
            inputs: proto.inputs.into_iter().map(Into::into).collect(),
            outputs: proto.outputs.into_iter().map(Into::into).collect(),
            params: proto.params,
        }
    }
}

// ============================================================================
// DatasetHandle / FailureDiagnostic conversions
// ============================================================================

impl From<DatasetHandle> for pb::DatasetHandle {
    fn from(handle: DatasetHandle) -> Self {
        pb::DatasetHandle {
            dataset: handle.dataset.into_inner(),
            location: handle.location,
        }
    }
}

impl From<pb::DatasetHandle> for DatasetHandle {
    fn from(proto: pb::DatasetHandle) -> Self {
        DatasetHandle::new(proto.dataset, proto.location)
    }
}

impl From<FailureDiagnostic> for pb::Diagnostic {
    fn from(diagnostic: FailureDiagnostic) -> Self {
        pb::Diagnostic {
            kind: diagnostic.kind,
            message: diagnostic.message,
        }
    }
}

impl From<pb::Diagnostic> for FailureDiagnostic {
    fn from(proto: pb::Diagnostic) -> Self {
        FailureDiagnostic::new(proto.kind, proto.message)
    }
}

// ============================================================================
// Assignment
// ============================================================================

impl pb::UnitAssignment {
    pub fn new(run_id: &RunId, unit_id: &UnitId, step: StepSpec, attempt: u32) -> Self {
        Self {
            run_id: run_id.to_string(),
            unit_id: unit_id.to_string(),
            step: Some(step.into()),
            attempt,
            issued_at_ms: Utc::now().timestamp_millis(),
        }
    }

    pub fn step_spec(&self) -> Result<StepSpec, ProtoError> {
        self.step
            .clone()
            .map(Into::into)
            .ok_or(ProtoError::MissingField("UnitAssignment.step"))
    }
}

// ============================================================================
// Report <-> UnitOutcome
// ============================================================================

impl pb::UnitReport {
    pub fn new(run_id: &RunId, unit_id: &UnitId, outcome: UnitOutcome) -> Self {
        let (status, outputs, diagnostic) = match outcome {
            UnitOutcome::Complete { outputs } => (
                pb::UnitStatus::Complete,
                outputs.into_iter().map(Into::into).collect(),
                None,
            ),
            UnitOutcome::Failed { diagnostic } => {
                (pb::UnitStatus::Failed, Vec::new(), Some(diagnostic.into()))
            }
            UnitOutcome::Cancelled => (pb::UnitStatus::Cancelled, Vec::new(), None),
        };
        Self {
            run_id: run_id.to_string(),
            unit_id: unit_id.to_string(),
            status: status as i32,
            outputs,
            diagnostic,
            finished_at_ms: Utc::now().timestamp_millis(),
        }
    }

    pub fn outcome(&self) -> Result<UnitOutcome, ProtoError> {
        let status = pb::UnitStatus::try_from(self.status).map_err(|_| ProtoError::InvalidEnum {
            field: "UnitReport.status",
            value: self.status,
        })?;
        match status {
            pb::UnitStatus::Complete => Ok(UnitOutcome::Complete {
                outputs: self.outputs.iter().cloned().map(Into::into).collect(),
            }),
            pb::UnitStatus::Failed => {
                let diagnostic = self
                    .diagnostic
                    .clone()
                    .ok_or(ProtoError::MissingField("UnitReport.diagnostic"))?;
                Ok(UnitOutcome::Failed {
                    diagnostic: diagnostic.into(),
                })
            }
            pb::UnitStatus::Cancelled => Ok(UnitOutcome::Cancelled),
            pb::UnitStatus::Unspecified => Err(ProtoError::InvalidEnum {
                field: "UnitReport.status",
                value: self.status,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_step_spec_roundtrip() {
        let step = StepSpec::new("transform")
            .reads("raw")
            .reads("lookup")
            .writes("clean")
            .with_param("mode", "strict");

        let proto: pb::StepSpec = step.clone().into();
        let back: StepSpec = proto.into();
        assert_eq!(step, back);
    }

    #[test]
    fn test_failed_report_carries_diagnostic() {
        let report = pb::UnitReport::new(
            &RunId::new("r1"),
            &UnitId::new("r1/b"),
            UnitOutcome::Failed {
                diagnostic: FailureDiagnostic::step_failed("exit status 2"),
            },
        );
        match report.outcome().unwrap() {
            UnitOutcome::Failed { diagnostic } => {
                assert_eq!(diagnostic.kind, FailureDiagnostic::STEP_FAILED);
                assert_eq!(diagnostic.message, "exit status 2");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_report_with_unspecified_status_is_rejected() {
        let mut report =
            pb::UnitReport::new(&RunId::new("r1"), &UnitId::new("r1/a"), UnitOutcome::Cancelled);
        report.status = pb::UnitStatus::Unspecified as i32;
        assert!(matches!(
            report.outcome(),
            Err(ProtoError::InvalidEnum { .. })
        ));

        report.status = 42;
        assert!(report.outcome().is_err());
    }

    #[test]
    fn test_failed_report_without_diagnostic_is_rejected() {
        let mut report =
            pb::UnitReport::new(&RunId::new("r1"), &UnitId::new("r1/a"), UnitOutcome::Cancelled);
        report.status = pb::UnitStatus::Failed as i32;
        assert!(matches!(report.outcome(), Err(ProtoError::MissingField(_))));
    }

    #[test]
    fn test_envelope_survives_encoding() {
        let assignment = pb::UnitAssignment::new(
            &RunId::new("r1"),
            &UnitId::new("r1/a"),
            StepSpec::new("a").writes("x"),
            1,
        );
        let envelope = pb::Envelope::new(Rank::MANAGER, Rank::new(3), Payload::Assign(assignment));
        let bytes = envelope.encode_to_vec();
        let decoded = pb::Envelope::decode(bytes.as_slice()).unwrap();

        assert_eq!(decoded.source_rank(), Rank::MANAGER);
        assert_eq!(decoded.target_rank(), Rank::new(3));
        assert_eq!(decoded.kind(), "assign");
        match decoded.payload {
            Some(Payload::Assign(a)) => assert_eq!(a.step_spec().unwrap().id.as_str(), "a"),
            _ => panic!("expected assignment"),
        }
    }
}
