use crate::error::EngineError;
use crate::script::ast::TypeName;
use crate::script::typeck::GlobalRef;
use crate::script::value::Value;
use crate::script::vm::GlobalStore;

/// State of one accepted submission: the values of its globals, in slot order.
#[derive(Debug, Clone)]
pub struct StateSlot {
    submission: u32,
    values: Vec<Value>,
}

impl StateSlot {
    pub fn submission(&self) -> u32 {
        self.submission
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, slot: u16) -> Option<&Value> {
        self.values.get(usize::from(slot))
    }
}

fn index(submission: u32) -> usize {
    usize::try_from(submission).unwrap_or(usize::MAX)
}

/// Per-submission state, indexed by submission id. Grows by doubling, never
/// shrinks, and never reassigns an installed slot.
#[derive(Debug)]
pub struct SubmissionState {
    slots: Vec<Option<StateSlot>>,
}

impl SubmissionState {
    pub fn with_capacity(initial: usize) -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(initial.max(1)).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of installed slots.
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Make room for `submission`, at least doubling when growth is needed.
    pub fn ensure_capacity(&mut self, submission: u32) {
        let needed = index(submission).saturating_add(1);
        if needed <= self.slots.len() {
            return;
        }
        let new_len = needed.max(self.slots.len() * 2);
        log::debug!("growing submission state {} -> {new_len}", self.slots.len());
        self.slots.resize_with(new_len, || None);
    }

    /// Assign the slot for `submission` with default values for its globals.
    pub fn install(&mut self, submission: u32, globals: &[TypeName]) -> Result<(), EngineError> {
        let entry = self
            .slots
            .get_mut(index(submission))
            .ok_or(EngineError::StateSlotMissing { submission })?;
        if entry.is_some() {
            return Err(EngineError::StateSlotOccupied { submission });
        }
        *entry = Some(StateSlot {
            submission,
            values: globals.iter().map(|ty| Value::default_for(*ty)).collect(),
        });
        Ok(())
    }

    /// Read-only view of a submission's slot.
    pub fn slot(&self, submission: u32) -> Option<&StateSlot> {
        self.slots.get(index(submission))?.as_ref()
    }

    pub fn global(&self, global: GlobalRef) -> Option<&Value> {
        self.slot(global.submission)?.get(global.slot)
    }
}

impl GlobalStore for SubmissionState {
    fn load(&self, global: GlobalRef) -> Option<Value> {
        self.global(global).cloned()
    }

    fn store(&mut self, global: GlobalRef, value: Value) -> bool {
        let target = self
            .slots
            .get_mut(index(global.submission))
            .and_then(Option::as_mut)
            .and_then(|s| s.values.get_mut(usize::from(global.slot)));
        match target {
            Some(v) => {
                *v = value;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn grows_by_doubling() {
        let mut state = SubmissionState::with_capacity(2);
        assert_eq!(state.capacity(), 2);
        state.ensure_capacity(1);
        assert_eq!(state.capacity(), 2);
        state.ensure_capacity(2);
        assert_eq!(state.capacity(), 4);
        state.ensure_capacity(4);
        assert_eq!(state.capacity(), 8);
        // Far jumps go straight to the needed size
        state.ensure_capacity(40);
        assert_eq!(state.capacity(), 41);
    }

    #[test]
    fn zero_capacity_is_bumped() {
        let mut state = SubmissionState::with_capacity(0);
        assert_eq!(state.capacity(), 1);
        state.ensure_capacity(1);
        assert_eq!(state.capacity(), 2);
    }

    #[test]
    fn slots_are_assigned_once() {
        let mut state = SubmissionState::with_capacity(2);
        state.install(0, &[TypeName::Int, TypeName::String]).unwrap();
        assert_eq!(
            state.install(0, &[]),
            Err(EngineError::StateSlotOccupied { submission: 0 })
        );
        assert_eq!(
            state.install(5, &[]),
            Err(EngineError::StateSlotMissing { submission: 5 })
        );
        let slot = state.slot(0).unwrap();
        assert_eq!(slot.submission(), 0);
        assert!(matches!(slot.values(), [Value::Int(0), Value::Null]));
        assert_eq!(state.occupied(), 1);
    }

    #[test]
    fn contents_are_mutable_through_the_store() {
        let mut state = SubmissionState::with_capacity(2);
        state.install(1, &[TypeName::Double]).unwrap();
        let g = GlobalRef { submission: 1, slot: 0 };
        assert!(state.store(g, Value::Double(2.5)));
        assert!(matches!(state.load(g), Some(Value::Double(v)) if (v - 2.5).abs() < f64::EPSILON));
        assert!(!state.store(GlobalRef { submission: 0, slot: 0 }, Value::Null));
        assert!(!state.store(GlobalRef { submission: 1, slot: 3 }, Value::Null));
    }
}
