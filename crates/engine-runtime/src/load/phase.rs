use crate::error::LoadError;
use std::fmt;

/// Stages of a load, always passed through in this order. Stages with
/// nothing to do are still entered and left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LoadPhase {
    Schemas,
    Tables,
    Data,
    Indexes,
    DependentObjects,
    Grants,
    Done,
}

impl LoadPhase {
    pub fn next(self) -> Option<LoadPhase> {
        match self {
            LoadPhase::Schemas => Some(LoadPhase::Tables),
            LoadPhase::Tables => Some(LoadPhase::Data),
            LoadPhase::Data => Some(LoadPhase::Indexes),
            LoadPhase::Indexes => Some(LoadPhase::DependentObjects),
            LoadPhase::DependentObjects => Some(LoadPhase::Grants),
            LoadPhase::Grants => Some(LoadPhase::Done),
            LoadPhase::Done => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadPhase::Schemas => "schemas",
            LoadPhase::Tables => "tables",
            LoadPhase::Data => "data",
            LoadPhase::Indexes => "indexes",
            LoadPhase::DependentObjects => "dependent_objects",
            LoadPhase::Grants => "grants",
            LoadPhase::Done => "done",
        }
    }
}

impl fmt::Display for LoadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The current phase of one load. Only moves forward, one step at a time.
#[derive(Debug)]
pub struct PhaseMachine {
    current: LoadPhase,
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self {
            current: LoadPhase::Schemas,
        }
    }

    pub fn current(&self) -> LoadPhase {
        self.current
    }

    pub fn transition(&mut self, to: LoadPhase) -> Result<LoadPhase, LoadError> {
        if self.current.next() != Some(to) {
            return Err(LoadError::Phase {
                from: self.current.to_string(),
                to: to.to_string(),
            });
        }
        self.current = to;
        Ok(to)
    }

    pub fn advance(&mut self) -> Result<LoadPhase, LoadError> {
        let to = self.current.next().ok_or_else(|| LoadError::Phase {
            from: self.current.to_string(),
            to: "none".to_string(),
        })?;
        self.transition(to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_every_phase_in_order() {
        let mut machine = PhaseMachine::new();
        let mut seen = vec![machine.current()];
        while machine.current() != LoadPhase::Done {
            seen.push(machine.advance().unwrap());
        }
        assert_eq!(seen.len(), 7);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert!(machine.advance().is_err());
    }

    #[test]
    fn rejects_skipping_and_going_back() {
        let mut machine = PhaseMachine::new();
        assert!(matches!(
            machine.transition(LoadPhase::Data),
            Err(LoadError::Phase { .. })
        ));
        machine.transition(LoadPhase::Tables).unwrap();
        assert!(machine.transition(LoadPhase::Schemas).is_err());
        assert_eq!(machine.current(), LoadPhase::Tables);
    }
}
