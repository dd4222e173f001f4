//! The contract every computational unit implements.
//!
//! Lifecycle: construct → [`Unit::negotiate_shape`] → repeated
//! [`Unit::forward`] / [`Unit::backward`]. Negotiation allocates all
//! shape-dependent state and may be repeated; each call replaces that state.
//! A training forward stores what the matching backward needs; backward
//! consumes it, so a second backward fails with [`LutError::State`].
//!
//! Commands are whitespace-separated `key value` strings delivered by
//! [`Unit::send_command`] to units whose instance name or class name matches
//! the target (or to everyone for `"all"`).

use crate::buffer::Buffer;
use crate::error::{LutError, Result};
use crate::shape::node_count;
use crate::snapshot::Snapshot;
use crate::sparse::SparseUnit;
use crate::variables::Variables;

/// Target string that matches every unit.
pub const TARGET_ALL: &str = "all";

/// Name and negotiated shapes carried by every unit.
#[derive(Debug, Clone, Default)]
pub struct UnitMeta {
    name: Option<String>,
    input_shape: Option<Vec<usize>>,
    output_shape: Option<Vec<usize>>,
}

impl UnitMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = Some(name.to_string());
    }

    pub fn input_shape(&self) -> Option<&[usize]> {
        self.input_shape.as_deref()
    }

    pub fn output_shape(&self) -> Option<&[usize]> {
        self.output_shape.as_deref()
    }

    pub fn set_shapes(&mut self, input: &[usize], output: &[usize]) {
        self.input_shape = Some(input.to_vec());
        self.output_shape = Some(output.to_vec());
    }

    pub fn clear_shapes(&mut self) {
        self.input_shape = None;
        self.output_shape = None;
    }

    /// Negotiated `(input, output)` shapes or a ShapeError naming `class`.
    pub fn shapes(&self, class: &str) -> Result<(&[usize], &[usize])> {
        match (self.input_shape(), self.output_shape()) {
            (Some(i), Some(o)) => Ok((i, o)),
            _ => Err(LutError::shape(format!("{class} used before negotiate_shape"))),
        }
    }

    /// Check a forward input against the negotiated input shape.
    pub fn check_input(&self, class: &str, x: &Buffer) -> Result<()> {
        let (input, _) = self.shapes(class)?;
        if x.node_count() != node_count(input) {
            return Err(LutError::shape(format!(
                "{class} negotiated for input {input:?} but received {:?}",
                x.shape()
            )));
        }
        Ok(())
    }

    /// Check a backward gradient against the negotiated output shape.
    pub fn check_output_grad(&self, class: &str, dy: &Buffer) -> Result<()> {
        let (_, output) = self.shapes(class)?;
        if dy.node_count() != node_count(output) {
            return Err(LutError::shape(format!(
                "{class} produces {output:?} but received a gradient of {:?}",
                dy.shape()
            )));
        }
        Ok(())
    }
}

pub trait Unit: Send {
    /// Class name used for command targeting and snapshots.
    fn class_name(&self) -> &'static str;

    fn meta(&self) -> &UnitMeta;
    fn meta_mut(&mut self) -> &mut UnitMeta;

    /// Instance name, defaulting to the class name.
    fn name(&self) -> &str {
        self.meta().name().unwrap_or(self.class_name())
    }

    fn set_name(&mut self, name: &str) {
        self.meta_mut().set_name(name);
    }

    fn input_shape(&self) -> Option<&[usize]> {
        self.meta().input_shape()
    }

    fn output_shape(&self) -> Option<&[usize]> {
        self.meta().output_shape()
    }

    /// Input node count, or 0 before negotiation.
    fn input_node_count(&self) -> usize {
        self.input_shape().map(node_count).unwrap_or(0)
    }

    /// Output node count, or 0 before negotiation.
    fn output_node_count(&self) -> usize {
        self.output_shape().map(node_count).unwrap_or(0)
    }

    /// Fix the per-frame input shape and return the output shape.
    fn negotiate_shape(&mut self, input_shape: &[usize]) -> Result<Vec<usize>>;

    fn forward(&mut self, x: &Buffer, train: bool) -> Result<Buffer>;

    /// Gradient w.r.t. the input of the last training forward. Parameter
    /// gradients are accumulated, never overwritten.
    fn backward(&mut self, dy: &Buffer) -> Result<Buffer>;

    /// Apply an already split command. Unrecognised keys are ignored.
    fn command(&mut self, _args: &[&str]) {}

    fn accepts(&self, target: &str) -> bool {
        target == TARGET_ALL || target == self.name() || target == self.class_name()
    }

    fn send_command(&mut self, command: &str, target: &str) {
        if self.accepts(target) {
            let args: Vec<&str> = command.split_whitespace().collect();
            self.command(&args);
        }
    }

    fn parameters(&self) -> Variables {
        Variables::new()
    }

    fn gradients(&self) -> Variables {
        Variables::new()
    }

    fn save(&self) -> Result<Snapshot> {
        Ok(Snapshot::new(self.class_name()))
    }

    fn load(&mut self, snapshot: &Snapshot) -> Result<()> {
        snapshot.expect_class(self.class_name())
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        self.save()?.to_bytes()
    }

    fn deserialize(&mut self, blob: &[u8]) -> Result<()> {
        let snapshot = Snapshot::from_bytes(blob)?;
        self.load(&snapshot)
    }

    /// Sparse-connectivity view, for units that have one.
    fn as_sparse(&self) -> Option<&dyn SparseUnit> {
        None
    }
}

/// Take the training cache, or fail when backward has no matching forward.
pub(crate) fn take_cache<T>(cache: &mut Option<T>, class: &str) -> Result<T> {
    cache.take().ok_or_else(|| {
        LutError::state(format!(
            "{class}: backward without a preceding training forward"
        ))
    })
}

/// `key value` command value as a boolean.
pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Some(true),
        "false" | "off" | "no" | "0" => Some(false),
        _ => None,
    }
}

/// Value of `key` in a split `key value` command.
pub(crate) fn command_value<'a>(args: &[&'a str], key: &str) -> Option<&'a str> {
    match args {
        [k, v, ..] if *k == key => Some(*v),
        _ => None,
    }
}
