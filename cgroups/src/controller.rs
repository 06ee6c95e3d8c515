use std::fmt::Display;

use serde::Serialize;

use crate::error::{Error, Result};

/// A parameter value staged for, or read from, a control file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Value {
    String(String),
    Int64(i64),
    Uint64(u64),
    Bool(bool),
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::String(s) => write!(f, "{s}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Uint64(v) => write!(f, "{v}"),
            Value::Bool(true) => write!(f, "1"),
            Value::Bool(false) => write!(f, "0"),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int64(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Uint64(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            Value::Uint64(v) => i64::try_from(*v).ok(),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::String(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Int64(v) => u64::try_from(*v).ok(),
            Value::Uint64(v) => Some(*v),
            Value::Bool(b) => Some(u64::from(*b)),
            Value::String(s) => s.trim().parse().ok(),
        }
    }

    /// Any integer reads as a bool, non-zero being true.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int64(v) => Some(*v != 0),
            Value::Uint64(v) => Some(*v != 0),
            Value::String(s) => s.trim().parse::<i64>().ok().map(|v| v != 0),
        }
    }
}

#[derive(Debug, Clone)]
struct Parameter {
    name: String,
    value: Value,
    dirty: bool,
}

/// A controller attached to a group, with the parameters staged for it.
#[derive(Debug, Clone)]
pub struct Controller {
    name: String,
    params: Vec<Parameter>,
}

impl Controller {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            params: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Stages a new parameter. Fails if the parameter is already staged.
    pub fn add_value<V: Into<Value>>(&mut self, name: &str, value: V) -> Result<()> {
        if self.params.iter().any(|p| p.name == name) {
            return Err(Error::ValueExists {
                controller: self.name.clone(),
                param: name.to_owned(),
            });
        }

        self.params.push(Parameter {
            name: name.to_owned(),
            value: value.into(),
            dirty: true,
        });
        Ok(())
    }

    pub fn add_value_string(&mut self, name: &str, value: &str) -> Result<()> {
        self.add_value(name, value)
    }

    pub fn add_value_int64(&mut self, name: &str, value: i64) -> Result<()> {
        self.add_value(name, value)
    }

    pub fn add_value_uint64(&mut self, name: &str, value: u64) -> Result<()> {
        self.add_value(name, value)
    }

    pub fn add_value_bool(&mut self, name: &str, value: bool) -> Result<()> {
        self.add_value(name, value)
    }

    /// Stages a parameter, overwriting any value staged before.
    pub fn set_value<V: Into<Value>>(&mut self, name: &str, value: V) {
        let value = value.into();
        match self.params.iter_mut().find(|p| p.name == name) {
            Some(param) => {
                param.value = value;
                param.dirty = true;
            }
            None => self.params.push(Parameter {
                name: name.to_owned(),
                value,
                dirty: true,
            }),
        }
    }

    pub fn set_value_string(&mut self, name: &str, value: &str) {
        self.set_value(name, value)
    }

    pub fn set_value_int64(&mut self, name: &str, value: i64) {
        self.set_value(name, value)
    }

    pub fn set_value_uint64(&mut self, name: &str, value: u64) {
        self.set_value(name, value)
    }

    pub fn set_value_bool(&mut self, name: &str, value: bool) {
        self.set_value(name, value)
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.params
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.value)
    }

    fn required(&self, name: &str) -> Result<&Value> {
        self.value(name).ok_or_else(|| Error::NotFound {
            controller: self.name.clone(),
            param: name.to_owned(),
        })
    }

    fn mismatch(name: &str, value: &Value, expected: &'static str) -> Error {
        Error::TypeMismatch {
            param: name.to_owned(),
            value: value.to_string(),
            expected,
        }
    }

    pub fn get_value_string(&self, name: &str) -> Result<String> {
        Ok(self.required(name)?.to_string())
    }

    pub fn get_value_int64(&self, name: &str) -> Result<i64> {
        let value = self.required(name)?;
        value
            .as_i64()
            .ok_or_else(|| Self::mismatch(name, value, "int64"))
    }

    pub fn get_value_uint64(&self, name: &str) -> Result<u64> {
        let value = self.required(name)?;
        value
            .as_u64()
            .ok_or_else(|| Self::mismatch(name, value, "uint64"))
    }

    pub fn get_value_bool(&self, name: &str) -> Result<bool> {
        let value = self.required(name)?;
        value
            .as_bool()
            .ok_or_else(|| Self::mismatch(name, value, "bool"))
    }

    /// Parameters in the order they were staged.
    pub fn values(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.params.iter().map(|p| (p.name.as_str(), &p.value))
    }

    /// Parameters changed since the last write or refresh.
    pub fn dirty_values(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.params
            .iter()
            .filter(|p| p.dirty)
            .map(|p| (p.name.as_str(), &p.value))
    }

    pub(crate) fn mark_clean(&mut self) {
        for param in &mut self.params {
            param.dirty = false;
        }
    }

    pub(crate) fn mark_dirty(&mut self) {
        for param in &mut self.params {
            param.dirty = true;
        }
    }

    /// Replaces every parameter with values read from the kernel.
    pub(crate) fn replace_values(&mut self, values: Vec<(String, String)>) {
        self.params = values
            .into_iter()
            .map(|(name, value)| Parameter {
                name,
                value: Value::String(value),
                dirty: false,
            })
            .collect();
    }

    pub fn compare(&self, other: &Controller) -> Result<()> {
        compare_controllers(self, other)
    }
}

/// Compares names, parameters and values of two controllers. Values compare by
/// what would be written to the kernel, so `Int64(512)` equals `"512"`.
pub fn compare_controllers(a: &Controller, b: &Controller) -> Result<()> {
    if a.name != b.name || a.params.len() != b.params.len() {
        return Err(Error::ControllerNotEqual);
    }

    for param in &a.params {
        match b.value(&param.name) {
            Some(value) if value.to_string() == param.value.to_string() => {}
            _ => return Err(Error::ControllerNotEqual),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::TestResult;

    #[test]
    fn test_add_value_rejects_duplicates() {
        let mut cpu = Controller::new("cpu");
        cpu.add_value_int64("cpu.shares", 512).unwrap();

        let err = cpu.add_value_string("cpu.shares", "1024").unwrap_err();
        assert!(matches!(err, Error::ValueExists { .. }));
        assert_eq!(cpu.get_value_int64("cpu.shares").unwrap(), 512);
    }

    #[test]
    fn test_set_value_overwrites() {
        let mut cpu = Controller::new("cpu");
        cpu.add_value_int64("cpu.shares", 512).unwrap();
        cpu.set_value_int64("cpu.shares", 1024);
        cpu.set_value_string("cpu.cfs_quota_us", "-1");

        assert_eq!(cpu.len(), 2);
        assert_eq!(cpu.get_value_int64("cpu.shares").unwrap(), 1024);
        assert_eq!(cpu.get_value_int64("cpu.cfs_quota_us").unwrap(), -1);
    }

    #[test]
    fn test_missing_value() {
        let cpu = Controller::new("cpu");
        assert!(matches!(
            cpu.get_value_string("cpu.shares"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_type_mismatch() {
        let mut memory = Controller::new("memory");
        memory.set_value_string("memory.max", "max");
        memory.set_value_int64("memory.oom_control", -1);

        assert!(matches!(
            memory.get_value_int64("memory.max"),
            Err(Error::TypeMismatch { expected: "int64", .. })
        ));
        assert!(matches!(
            memory.get_value_uint64("memory.oom_control"),
            Err(Error::TypeMismatch { expected: "uint64", .. })
        ));
        assert!(matches!(
            memory.get_value_bool("memory.max"),
            Err(Error::TypeMismatch { expected: "bool", .. })
        ));
    }

    #[test]
    fn test_bool_coercion() {
        let mut cpuset = Controller::new("cpuset");
        cpuset.set_value_bool("cpuset.cpu_exclusive", true);
        cpuset.set_value_string("cpuset.mem_exclusive", "0\n");
        cpuset.set_value_int64("cpuset.sched_load_balance", 2);

        assert_eq!(
            cpuset.get_value_string("cpuset.cpu_exclusive").unwrap(),
            "1"
        );
        assert!(!cpuset.get_value_bool("cpuset.mem_exclusive").unwrap());
        assert!(cpuset.get_value_bool("cpuset.sched_load_balance").unwrap());
    }

    #[test]
    fn test_dirty_tracking() {
        let mut cpu = Controller::new("cpu");
        cpu.add_value_int64("cpu.shares", 512).unwrap();
        cpu.add_value_int64("cpu.cfs_quota_us", 1000).unwrap();
        cpu.mark_clean();
        assert_eq!(cpu.dirty_values().count(), 0);

        cpu.set_value_int64("cpu.shares", 256);
        let dirty: Vec<&str> = cpu.dirty_values().map(|(name, _)| name).collect();
        assert_eq!(dirty, vec!["cpu.shares"]);
    }

    #[test]
    fn test_replace_values_is_not_additive() {
        let mut cpu = Controller::new("cpu");
        cpu.add_value_int64("cpu.rt_runtime_us", 0).unwrap();
        cpu.replace_values(vec![("cpu.shares".to_owned(), "1024".to_owned())]);

        assert!(cpu.value("cpu.rt_runtime_us").is_none());
        assert_eq!(cpu.get_value_uint64("cpu.shares").unwrap(), 1024);
        assert_eq!(cpu.dirty_values().count(), 0);
    }

    #[test]
    fn test_compare_controllers() {
        let mut a = Controller::new("cpu");
        a.add_value_int64("cpu.shares", 512).unwrap();
        a.add_value_string("cpu.cfs_quota_us", "-1").unwrap();

        let mut b = Controller::new("cpu");
        b.add_value_string("cpu.cfs_quota_us", "-1").unwrap();
        b.add_value_string("cpu.shares", "512").unwrap();
        assert!(compare_controllers(&a, &b).is_ok());

        b.set_value_int64("cpu.shares", 256);
        assert!(matches!(compare_controllers(&a, &b), Err(Error::ControllerNotEqual)));

        let c = Controller::new("memory");
        assert!(matches!(a.compare(&c), Err(Error::ControllerNotEqual)));
    }

    quickcheck! {
        fn property_string_round_trip(value: String) -> bool {
            let mut c = Controller::new("test");
            c.set_value_string("test.value", &value);
            c.get_value_string("test.value").unwrap() == value
        }

        fn property_int64_round_trip(value: i64) -> bool {
            let mut c = Controller::new("test");
            c.set_value_int64("test.value", value);
            c.get_value_int64("test.value").unwrap() == value
        }

        fn property_uint64_round_trip(value: u64) -> bool {
            let mut c = Controller::new("test");
            c.set_value_uint64("test.value", value);
            c.get_value_uint64("test.value").unwrap() == value
        }

        fn property_bool_round_trip(value: bool) -> bool {
            let mut c = Controller::new("test");
            c.set_value_bool("test.value", value);
            c.get_value_bool("test.value").unwrap() == value
        }

        fn property_int64_survives_kernel_text(value: i64) -> TestResult {
            let mut c = Controller::new("test");
            c.replace_values(vec![("test.value".to_owned(), value.to_string())]);
            TestResult::from_bool(c.get_value_int64("test.value").unwrap() == value)
        }
    }
}
