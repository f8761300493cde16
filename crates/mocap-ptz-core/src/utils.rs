/// Observes a value and reports when it changes.
///
/// Used to log state transitions once instead of on every loop iteration.
#[derive(Clone, Debug)]
pub struct ChangeDetector<T: PartialEq + Clone> {
    old_value: Option<T>,
}

impl<T: PartialEq + Clone> Default for ChangeDetector<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: PartialEq + Clone> ChangeDetector<T> {
    pub fn new() -> Self {
        Self { old_value: None }
    }

    pub fn new_with_initial_state(val: &T) -> Self {
        Self {
            old_value: Some(val.clone()),
        }
    }

    /// Update the stored value.
    ///
    /// Returns true if the value has changed vs the previous
    /// call. The first call always returns false.
    pub fn update(&mut self, val: &T) -> bool {
        let changed = matches!(self.old_value, Some(ref old) if old != val);
        self.old_value = Some(val.clone());
        changed
    }

    /// Update the stored value and, if the value has changed, test if the new
    /// value is equal to `to`.
    pub fn update_and_has_changed_to(&mut self, val: &T, to: &T) -> bool {
        self.update(val) && *val == *to
    }

    pub fn value(&self) -> Option<&T> {
        self.old_value.as_ref()
    }
}

#[test]
fn test_change_detector() {
    let mut cd = ChangeDetector::new();
    assert!(!cd.update(&false));
    assert!(!cd.update(&false));
    assert!(cd.update(&true));
    assert!(!cd.update(&true));
    assert!(cd.update_and_has_changed_to(&false, &false));
    assert!(!cd.update_and_has_changed_to(&true, &false));

    let mut cd = ChangeDetector::new_with_initial_state(&1u8);
    assert!(cd.update(&2));
    assert_eq!(cd.value(), Some(&2));
}
