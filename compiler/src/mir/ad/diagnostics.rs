//! Differentiation diagnostics
//!
//! Errors raised by the pass carry a primary location. When they are
//! reported, the call chain that made the failing function a
//! differentiation target is attached as ordered secondary notes, innermost
//! first, ending at the `fwd_diff`/`bwd_diff` request that started it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::mir::function::ValidationError;
use crate::mir::module::MirModule;
use crate::mir::types::MirType;
use crate::mir::value::Span;

/// Function plus optional span inside it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub function: String,
    pub span: Option<Span>,
}

impl SourceLocation {
    pub fn new(function: &str, span: Option<Span>) -> Self {
        Self {
            function: function.to_string(),
            span,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.span {
            Some(span) => write!(f, "{} @ {}", self.function, span),
            None => write!(f, "{}", self.function),
        }
    }
}

/// One edge of the differentiation call graph, as reached from a request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    /// Function containing the call (or the request)
    pub caller: String,
    pub callee: String,
    pub span: Option<Span>,
}

impl CallSite {
    pub fn new(caller: &str, callee: &str, span: Option<Span>) -> Self {
        Self {
            caller: caller.to_string(),
            callee: callee.to_string(),
            span,
        }
    }
}

/// Errors raised while differentiating one entry point
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum DiffError {
    #[error("`{op}` has no derivative rule but is reached from a differentiation request (in `{}`)", .location.function)]
    NonDifferentiableOperation { op: String, location: SourceLocation },

    #[error("type `{ty}` has no differential: {reason}")]
    MissingDifferentialWitness {
        ty: MirType,
        reason: String,
        location: Option<SourceLocation>,
    },

    #[error("recursive differentiation is not supported: {}", .cycle.join(" -> "))]
    RecursionUnsupported {
        cycle: Vec<String>,
        location: SourceLocation,
    },

    #[error("differentiation expanded past depth {limit} at `{at}`")]
    ExpansionTooDeep {
        limit: usize,
        at: String,
        location: Option<SourceLocation>,
    },

    #[error("pullback of `{function}` accumulates {found} into an adjoint of {expected}")]
    TypeMismatchInPullback {
        function: String,
        expected: MirType,
        found: MirType,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl DiffError {
    pub fn kind(&self) -> DiagnosticKind {
        match self {
            DiffError::NonDifferentiableOperation { .. } => DiagnosticKind::NonDifferentiableOperation,
            DiffError::MissingDifferentialWitness { .. } => DiagnosticKind::MissingDifferentialWitness,
            DiffError::RecursionUnsupported { .. } => DiagnosticKind::RecursionUnsupported,
            DiffError::ExpansionTooDeep { .. } => DiagnosticKind::ExpansionTooDeep,
            DiffError::TypeMismatchInPullback { .. } => DiagnosticKind::TypeMismatchInPullback,
            DiffError::Internal(_) => DiagnosticKind::Internal,
        }
    }

    pub fn location(&self) -> Option<SourceLocation> {
        match self {
            DiffError::NonDifferentiableOperation { location, .. }
            | DiffError::RecursionUnsupported { location, .. } => Some(location.clone()),
            DiffError::MissingDifferentialWitness { location, .. }
            | DiffError::ExpansionTooDeep { location, .. } => location.clone(),
            DiffError::TypeMismatchInPullback { function, .. } => {
                Some(SourceLocation::new(function, None))
            }
            DiffError::Internal(_) => None,
        }
    }

    /// Input the pass cannot transform because it is not well-formed MIR
    pub fn malformed(function: &str, err: ValidationError) -> Self {
        DiffError::Internal(format!("`{}` is malformed: {}", function, err))
    }

    /// Attach a location if the error does not carry one yet
    pub fn at(mut self, loc: SourceLocation) -> Self {
        match &mut self {
            DiffError::MissingDifferentialWitness { location, .. }
            | DiffError::ExpansionTooDeep { location, .. }
                if location.is_none() =>
            {
                *location = Some(loc)
            }
            _ => {}
        }
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosticKind {
    NonDifferentiableOperation,
    MissingDifferentialWitness,
    RecursionUnsupported,
    ExpansionTooDeep,
    TypeMismatchInPullback,
    /// Warning: varying arguments passed to a call with no derivative
    NonDifferentiableCall,
    Internal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// Secondary location with its note
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticNote {
    pub location: SourceLocation,
    pub note: String,
}

/// A reported error or warning
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub severity: Severity,
    pub primary: Option<SourceLocation>,
    pub message: String,
    pub notes: Vec<DiagnosticNote>,
}

impl Diagnostic {
    pub fn from_error(err: &DiffError) -> Self {
        Self {
            kind: err.kind(),
            severity: Severity::Error,
            primary: err.location(),
            message: err.to_string(),
            notes: Vec::new(),
        }
    }

    pub fn warning(kind: DiagnosticKind, location: SourceLocation, message: String) -> Self {
        Self {
            kind,
            severity: Severity::Warning,
            primary: Some(location),
            message,
            notes: Vec::new(),
        }
    }

    pub fn with_note(mut self, location: SourceLocation, note: String) -> Self {
        self.notes.push(DiagnosticNote { location, note });
        self
    }

    /// Point at the definition of the function the primary location is in
    pub fn with_definition(mut self, module: &MirModule) -> Self {
        let defined = self
            .primary
            .as_ref()
            .and_then(|p| module.get_function(&p.function));
        if let Some(func) = defined {
            self.notes.push(DiagnosticNote {
                location: SourceLocation::new(&func.name, func.span),
                note: format!("see definition of `{}`", func.name),
            });
        }
        self
    }

    /// Attach "see using of" notes for a chain ordered from the request
    /// outward-in, so the innermost call is reported first.
    pub fn with_call_chain(mut self, chain: &[CallSite]) -> Self {
        for (i, site) in chain.iter().enumerate().rev() {
            let note = if i == 0 {
                format!("see request of `{}`", site.callee)
            } else {
                format!("see using of `{}`", site.callee)
            };
            self.notes.push(DiagnosticNote {
                location: SourceLocation::new(&site.caller, site.span),
                note,
            });
        }
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{}[{:?}]: {}", level, self.kind, self.message)?;
        if let Some(primary) = &self.primary {
            write!(f, "\n  --> {}", primary)?;
        }
        for note in &self.notes {
            write!(f, "\n  note: {} ({})", note.note, note.location)?;
        }
        Ok(())
    }
}

/// Collected diagnostics of one pass run
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticSink {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Error => log::debug!("diagnostic: {}", diagnostic),
            Severity::Warning => log::warn!("{}", diagnostic),
        }
        self.diagnostics.push(diagnostic);
    }

    pub fn extend(&mut self, diagnostics: impl IntoIterator<Item = Diagnostic>) {
        for d in diagnostics {
            self.push(d);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter()
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.is_error())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| !d.is_error())
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.is_error())
    }

    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    /// Export for the driver's reporting sink
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.diagnostics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_chain_notes_innermost_first() {
        let err = DiffError::NonDifferentiableOperation {
            op: "shuffle".into(),
            location: SourceLocation::new("leaf", Some(Span::new(40, 52, 0))),
        };
        let chain = vec![
            CallSite::new("main", "outer", Some(Span::new(1, 5, 0))),
            CallSite::new("outer", "middle", Some(Span::new(10, 16, 0))),
            CallSite::new("middle", "leaf", Some(Span::new(20, 24, 0))),
        ];
        let diag = Diagnostic::from_error(&err).with_call_chain(&chain);

        assert_eq!(diag.kind, DiagnosticKind::NonDifferentiableOperation);
        assert_eq!(diag.primary.as_ref().map(|l| l.function.as_str()), Some("leaf"));
        let notes: Vec<&str> = diag.notes.iter().map(|n| n.note.as_str()).collect();
        assert_eq!(
            notes,
            vec![
                "see using of `leaf`",
                "see using of `middle`",
                "see request of `outer`"
            ]
        );
        assert_eq!(diag.notes[0].location.function, "middle");
        assert_eq!(diag.notes[2].location.function, "main");
    }

    #[test]
    fn test_definition_note_points_at_failing_function() {
        use crate::mir::block::Terminator;
        use crate::mir::function::FunctionSignature;
        use crate::mir::module::ModuleBuilder;

        let mut mb = ModuleBuilder::new("t");
        mb.function("leaf", FunctionSignature::new(vec![MirType::F32], MirType::F32), |f| {
            f.set_function_span(Span::new(30, 90, 3));
            let x = f.param(0).unwrap();
            f.terminate(Terminator::Return { value: Some(x) });
        });
        let module = mb.build();

        let err = DiffError::NonDifferentiableOperation {
            op: "bitcast".into(),
            location: SourceLocation::new("leaf", Some(Span::new(40, 52, 3))),
        };
        let chain = vec![CallSite::new("main", "leaf", Some(Span::new(1, 5, 0)))];
        let diag = Diagnostic::from_error(&err)
            .with_definition(&module)
            .with_call_chain(&chain);

        let notes: Vec<&str> = diag.notes.iter().map(|n| n.note.as_str()).collect();
        assert_eq!(notes, vec!["see definition of `leaf`", "see request of `leaf`"]);
        assert_eq!(diag.notes[0].location, SourceLocation::new("leaf", Some(Span::new(30, 90, 3))));
        assert!(diag.to_string().contains("note: see definition of `leaf`"));

        // nothing to point at when the primary function is not in the module
        let elsewhere = DiffError::TypeMismatchInPullback {
            function: "gone".into(),
            expected: MirType::F32,
            found: MirType::F64,
        };
        assert!(Diagnostic::from_error(&elsewhere).with_definition(&module).notes.is_empty());
    }

    #[test]
    fn test_sink_json_export() {
        let mut sink = DiagnosticSink::new();
        sink.push(Diagnostic::from_error(&DiffError::RecursionUnsupported {
            cycle: vec!["a".into(), "b".into(), "a".into()],
            location: SourceLocation::new("b", None),
        }));
        sink.push(Diagnostic::warning(
            DiagnosticKind::NonDifferentiableCall,
            SourceLocation::new("f", None),
            "call to `g` has no derivative".into(),
        ));

        assert!(sink.has_errors());
        assert_eq!(sink.errors().count(), 1);
        assert_eq!(sink.warnings().count(), 1);

        let json = sink.to_json().unwrap();
        let parsed: Vec<Diagnostic> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0].kind, DiagnosticKind::RecursionUnsupported);
        assert!(parsed[0].message.contains("a -> b -> a"));
        assert_eq!(parsed[1].severity, Severity::Warning);
        assert!(json.contains("\"warning\""));
    }

    #[test]
    fn test_at_fills_missing_location_only() {
        let err = DiffError::MissingDifferentialWitness {
            ty: MirType::F32,
            reason: "test".into(),
            location: None,
        }
        .at(SourceLocation::new("f", None));
        assert_eq!(err.location().map(|l| l.function), Some("f".to_string()));

        let err = err.at(SourceLocation::new("g", None));
        assert_eq!(err.location().map(|l| l.function), Some("f".to_string()));
    }
}
