//! Ordered composition of units.

use tracing::debug;

use crate::buffer::Buffer;
use crate::error::{LutError, Result};
use crate::shape::describe;
use crate::snapshot::Snapshot;
use crate::unit::{Unit, UnitMeta};
use crate::variables::Variables;

/// Runs children in order on forward and in reverse on backward.
///
/// `push` / `set` may be called at any time but invalidate negotiation:
/// forward fails with a ShapeError until `negotiate_shape` runs again.
#[derive(Default)]
pub struct Sequential {
    meta: UnitMeta,
    units: Vec<Box<dyn Unit>>,
    negotiated: bool,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_units(units: Vec<Box<dyn Unit>>) -> Self {
        Self {
            meta: UnitMeta::new(),
            units,
            negotiated: false,
        }
    }

    pub fn push(&mut self, unit: impl Unit + 'static) {
        self.push_boxed(Box::new(unit));
    }

    pub fn push_boxed(&mut self, unit: Box<dyn Unit>) {
        self.units.push(unit);
        self.invalidate();
    }

    /// Replace the child at `index`, returning the previous one.
    pub fn set(&mut self, index: usize, unit: Box<dyn Unit>) -> Result<Box<dyn Unit>> {
        let len = self.units.len();
        let slot = self.units.get_mut(index).ok_or_else(|| {
            LutError::state(format!("Sequential has {len} units, cannot set index {index}"))
        })?;
        let previous = std::mem::replace(slot, unit);
        self.invalidate();
        Ok(previous)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&dyn Unit> {
        self.units.get(index).map(|u| u.as_ref())
    }

    /// Mutable access to a child. Replacing a child goes through [`Sequential::set`].
    pub fn get_mut(&mut self, index: usize) -> Option<&mut dyn Unit> {
        self.units.get_mut(index).map(|u| -> &mut dyn Unit { &mut **u })
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Unit> {
        self.units.iter().map(|u| u.as_ref())
    }

    pub fn is_negotiated(&self) -> bool {
        self.negotiated
    }

    /// Deliver a command to every child without testing this container.
    pub fn send_to_children(&mut self, command: &str, target: &str) {
        for unit in &mut self.units {
            unit.send_command(command, target);
        }
    }

    fn invalidate(&mut self) {
        self.negotiated = false;
        self.meta.clear_shapes();
    }

    fn require_negotiated(&self) -> Result<()> {
        if !self.negotiated {
            return Err(LutError::shape(format!(
                "{} changed or not negotiated; call negotiate_shape first",
                self.name()
            )));
        }
        Ok(())
    }
}

impl Unit for Sequential {
    fn class_name(&self) -> &'static str {
        "Sequential"
    }

    fn meta(&self) -> &UnitMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut UnitMeta {
        &mut self.meta
    }

    fn negotiate_shape(&mut self, input_shape: &[usize]) -> Result<Vec<usize>> {
        let mut shape = input_shape.to_vec();
        for unit in &mut self.units {
            shape = unit.negotiate_shape(&shape)?;
        }
        self.meta.set_shapes(input_shape, &shape);
        self.negotiated = true;
        debug!(
            unit = self.name(),
            children = self.units.len(),
            input = %describe(input_shape),
            output = %describe(&shape),
            "negotiated shape"
        );
        Ok(shape)
    }

    fn forward(&mut self, x: &Buffer, train: bool) -> Result<Buffer> {
        self.require_negotiated()?;
        self.meta.check_input(self.class_name(), x)?;
        let mut x = x.clone();
        for unit in &mut self.units {
            x = unit.forward(&x, train)?;
        }
        Ok(x)
    }

    fn backward(&mut self, dy: &Buffer) -> Result<Buffer> {
        self.require_negotiated()?;
        let mut dy = dy.clone();
        for unit in self.units.iter_mut().rev() {
            dy = unit.backward(&dy)?;
        }
        Ok(dy)
    }

    fn send_command(&mut self, command: &str, target: &str) {
        if self.accepts(target) {
            let args: Vec<&str> = command.split_whitespace().collect();
            self.command(&args);
        }
        self.send_to_children(command, target);
    }

    fn parameters(&self) -> Variables {
        let mut vars = Variables::new();
        for unit in &self.units {
            vars.extend(unit.parameters());
        }
        vars
    }

    fn gradients(&self) -> Variables {
        let mut vars = Variables::new();
        for unit in &self.units {
            vars.extend(unit.gradients());
        }
        vars
    }

    fn save(&self) -> Result<Snapshot> {
        let mut snapshot = Snapshot::new(self.class_name());
        for unit in &self.units {
            snapshot.children.push(unit.save()?);
        }
        Ok(snapshot)
    }

    fn load(&mut self, snapshot: &Snapshot) -> Result<()> {
        snapshot.expect_class(self.class_name())?;
        let children = snapshot.expect_children(self.units.len())?;
        for (unit, child) in self.units.iter_mut().zip(children) {
            unit.load(child)?;
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{command_value, take_cache};
    use candle_core::{Device, Tensor, Var};
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    /// `y = k · x` with a learnable scalar `k`, for exercising composition.
    struct Scale {
        meta: UnitMeta,
        k: Var,
        dk: Var,
        cache: Option<Tensor>,
        log: Log,
    }

    impl Scale {
        fn new(k: f32) -> Self {
            Self::logged(k, Log::default())
        }

        fn logged(k: f32, log: Log) -> Self {
            let dev = Device::Cpu;
            Self {
                meta: UnitMeta::new(),
                k: Var::from_tensor(&Tensor::new(&[k], &dev).unwrap()).unwrap(),
                dk: Var::from_tensor(&Tensor::new(&[0f32], &dev).unwrap()).unwrap(),
                cache: None,
                log,
            }
        }
    }

    impl Unit for Scale {
        fn class_name(&self) -> &'static str {
            "Scale"
        }
        fn meta(&self) -> &UnitMeta {
            &self.meta
        }
        fn meta_mut(&mut self) -> &mut UnitMeta {
            &mut self.meta
        }
        fn negotiate_shape(&mut self, input_shape: &[usize]) -> Result<Vec<usize>> {
            self.meta.set_shapes(input_shape, input_shape);
            Ok(input_shape.to_vec())
        }
        fn forward(&mut self, x: &Buffer, train: bool) -> Result<Buffer> {
            let t = x.tensor()?;
            let y = t.broadcast_mul(self.k.as_tensor())?;
            self.cache = if train { Some(t) } else { None };
            Buffer::from_tensor(y, x.shape())
        }
        fn backward(&mut self, dy: &Buffer) -> Result<Buffer> {
            let x = take_cache(&mut self.cache, "Scale")?;
            let g = dy.tensor()?;
            let dk = g.mul(&x)?.sum_all()?.reshape(1)?;
            self.dk.set(&self.dk.as_tensor().add(&dk)?)?;
            Buffer::from_tensor(g.broadcast_mul(self.k.as_tensor())?, dy.shape())
        }
        fn command(&mut self, args: &[&str]) {
            if let Some(v) = command_value(args, "tag") {
                self.log.lock().unwrap().push(format!("{}:{v}", self.name()));
            }
        }
        fn parameters(&self) -> Variables {
            Variables::from(vec![self.k.clone()])
        }
        fn gradients(&self) -> Variables {
            Variables::from(vec![self.dk.clone()])
        }
    }

    fn input(dev: &Device) -> Buffer {
        Buffer::from_vec(vec![1.0, 2.0, 3.0, 4.0], 2, &[2], dev).unwrap()
    }

    #[test]
    fn negotiation_is_idempotent() {
        let mut seq = Sequential::new();
        seq.push(Scale::new(2.0));
        seq.push(Scale::new(3.0));
        let first = seq.negotiate_shape(&[2]).unwrap();
        let second = seq.negotiate_shape(&[2]).unwrap();
        assert_eq!(first, second);
        assert_eq!(seq.output_shape(), Some(&[2][..]));
    }

    #[test]
    fn forward_and_backward_chain() {
        let dev = Device::Cpu;
        let mut seq = Sequential::new();
        seq.push(Scale::new(2.0));
        seq.push(Scale::new(3.0));
        seq.negotiate_shape(&[2]).unwrap();

        let y = seq.forward(&input(&dev), true).unwrap();
        assert_eq!(y.to_vec2().unwrap(), vec![vec![6.0, 12.0], vec![18.0, 24.0]]);

        let dy = Buffer::from_vec(vec![1.0; 4], 2, &[2], &dev).unwrap();
        let dx = seq.backward(&dy).unwrap();
        assert_eq!(dx.to_vec2().unwrap(), vec![vec![6.0, 6.0], vec![6.0, 6.0]]);

        // dk of the second unit: Σ dy · (2x) = 2 · 10; of the first: Σ 3 · x = 30.
        let grads = seq.gradients();
        assert_eq!(grads.len(), 2);
        assert_eq!(grads.get(0).unwrap().as_tensor().to_vec1::<f32>().unwrap(), vec![30.0]);
        assert_eq!(grads.get(1).unwrap().as_tensor().to_vec1::<f32>().unwrap(), vec![20.0]);
        assert_eq!(seq.parameters().len(), 2);
    }

    #[test]
    fn mutation_requires_renegotiation() {
        let dev = Device::Cpu;
        let mut seq = Sequential::new();
        seq.push(Scale::new(1.0));
        seq.negotiate_shape(&[2]).unwrap();
        seq.push(Scale::new(1.0));
        assert!(matches!(seq.forward(&input(&dev), false), Err(LutError::Shape(_))));
        seq.negotiate_shape(&[2]).unwrap();
        assert!(seq.forward(&input(&dev), false).is_ok());

        let old = seq.set(0, Box::new(Scale::new(5.0))).unwrap();
        assert_eq!(old.class_name(), "Scale");
        assert!(!seq.is_negotiated());
        assert!(seq.set(9, Box::new(Scale::new(5.0))).is_err());
    }

    #[test]
    fn child_access_keeps_negotiation() {
        let dev = Device::Cpu;
        let mut seq = Sequential::new();
        seq.push(Scale::new(2.0));
        seq.negotiate_shape(&[2]).unwrap();

        let child: &mut dyn Unit = seq.get_mut(0).unwrap();
        child.set_name("renamed");
        assert!(seq.get_mut(1).is_none());
        assert!(seq.is_negotiated());
        assert_eq!(seq.get(0).unwrap().name(), "renamed");
        assert!(seq.forward(&input(&dev), false).is_ok());

        seq.set(0, Box::new(Scale::new(3.0))).unwrap();
        assert!(matches!(seq.forward(&input(&dev), false), Err(LutError::Shape(_))));
    }

    #[test]
    fn commands_reach_children_by_name_or_class() {
        let log = Log::default();
        let mut seq = Sequential::new();
        let mut named = Scale::logged(1.0, log.clone());
        named.set_name("second");
        seq.push(Scale::logged(1.0, log.clone()));
        seq.push(named);

        seq.send_command("tag a", "second");
        seq.send_command("tag b", "Scale");
        seq.send_command("tag c", "all");
        seq.send_command("tag d", "nobody");
        seq.send_command("tag e", "Sequential");

        let seen = log.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec!["second:a", "Scale:b", "second:b", "Scale:c", "second:c"]
        );
    }

    #[test]
    fn empty_sequential_is_identity() {
        let dev = Device::Cpu;
        let mut seq = Sequential::new();
        assert_eq!(seq.negotiate_shape(&[2]).unwrap(), vec![2]);
        let y = seq.forward(&input(&dev), true).unwrap();
        assert_eq!(y.to_vec2().unwrap(), input(&dev).to_vec2().unwrap());
    }
}
