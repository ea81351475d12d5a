//! Sandboxed cost expressions.
//!
//! Expressions are CEL, compiled once per snapshot and evaluated per
//! request with the model name, backend name, and token counters bound.
//! Compilation failures are configuration errors and abort the reload;
//! evaluation failures surface as per-request errors.

use cel_interpreter::{Context, Program, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CostError {
    #[error("failed to compile cost expression '{expression}': {message}")]
    Compile { expression: String, message: String },
    #[error("failed to evaluate cost expression '{expression}': {message}")]
    Evaluate { expression: String, message: String },
    #[error("cost expression '{expression}' produced non-numeric result")]
    NonNumeric { expression: String },
    #[error("cost expression '{expression}' produced negative result {value}")]
    Negative { expression: String, value: i64 },
}

/// A compiled cost expression. Shared read-only by every stream that
/// captured the owning snapshot.
pub struct CelCostProgram {
    source: String,
    program: Program,
}

impl std::fmt::Debug for CelCostProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CelCostProgram")
            .field("source", &self.source)
            .finish()
    }
}

impl CelCostProgram {
    /// Compile and probe-evaluate an expression. The probe run catches
    /// references to unknown variables before the snapshot is published.
    pub fn compile(expression: &str) -> Result<Self, CostError> {
        let program = Program::compile(expression).map_err(|e| CostError::Compile {
            expression: expression.to_string(),
            message: e.to_string(),
        })?;
        let compiled = Self {
            source: expression.to_string(),
            program,
        };
        match compiled.evaluate("dummy", "dummy", 1, 1, 1) {
            // A negative probe result only reflects the dummy bindings.
            Ok(_) | Err(CostError::Negative { .. }) => Ok(compiled),
            Err(e) => Err(CostError::Compile {
                expression: expression.to_string(),
                message: e.to_string(),
            }),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate with the request's bindings. The result is an unsigned
    /// 64-bit count; the metadata encoding later truncates it to 32 bits.
    pub fn evaluate(
        &self,
        model: &str,
        backend: &str,
        input_tokens: u32,
        output_tokens: u32,
        total_tokens: u32,
    ) -> Result<u64, CostError> {
        let mut context = Context::default();
        context.add_variable_from_value("model", model.to_string());
        context.add_variable_from_value("backend", backend.to_string());
        context.add_variable_from_value("input_tokens", i64::from(input_tokens));
        context.add_variable_from_value("output_tokens", i64::from(output_tokens));
        context.add_variable_from_value("total_tokens", i64::from(total_tokens));

        let value = self
            .program
            .execute(&context)
            .map_err(|e| CostError::Evaluate {
                expression: self.source.clone(),
                message: e.to_string(),
            })?;
        match value {
            Value::UInt(v) => Ok(v),
            Value::Int(v) if v >= 0 => Ok(v as u64),
            Value::Int(v) => Err(CostError::Negative {
                expression: self.source.clone(),
                value: v,
            }),
            _ => Err(CostError::NonNumeric {
                expression: self.source.clone(),
            }),
        }
    }
}
