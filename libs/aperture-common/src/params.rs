use serde_json::{Map, Value};

use crate::error::ParamError;
use crate::message::{insert_path, lookup_path};

/// Getter: read one bound field of the owner as a JSON value.
pub type GetterFn<T> = fn(&T) -> Value;

/// Setter: assign one bound field of the owner from a JSON value.
/// On type mismatch, returns the expected-type name; the container turns
/// it into a `ParamError` carrying the bound path.
pub type SetterFn<T> = fn(&mut T, &Value) -> Result<(), &'static str>;

struct Binding<T> {
    path: String,
    get: GetterFn<T>,
    set: SetterFn<T>,
}

/// Reflection-free binding of `/`-separated parameter paths to typed
/// fields of an owner struct.
///
/// `encode` produces the complete nested JSON object for all bound paths;
/// `update` assigns only the leaves present in the input, so sparse client
/// configuration messages leave the remaining fields untouched. Vector
/// fields are replaced as a whole on update.
pub struct ParamContainer<T> {
    bindings: Vec<Binding<T>>,
}

impl<T> Default for ParamContainer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for ParamContainer<T> {
    fn clone(&self) -> Self {
        Self {
            bindings: self
                .bindings
                .iter()
                .map(|b| Binding {
                    path: b.path.clone(),
                    get: b.get,
                    set: b.set,
                })
                .collect(),
        }
    }
}

impl<T> ParamContainer<T> {
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    /// Bind a parameter path to a getter/setter pair.
    pub fn bind(&mut self, path: impl Into<String>, get: GetterFn<T>, set: SetterFn<T>) {
        self.bindings.push(Binding {
            path: path.into(),
            get,
            set,
        });
    }

    /// Encode the current values of all bound parameters into one nested
    /// JSON object.
    pub fn encode(&self, owner: &T) -> Value {
        let mut root = Value::Object(Map::new());
        for binding in &self.bindings {
            insert_path(&mut root, &binding.path, (binding.get)(owner));
        }
        root
    }

    /// Update bound parameters from a JSON object. Only paths present in
    /// the input are assigned; unknown paths in the input are ignored.
    pub fn update(&self, owner: &mut T, value: &Value) -> Result<(), ParamError> {
        for binding in &self.bindings {
            if let Ok(leaf) = lookup_path(value, &binding.path) {
                (binding.set)(owner, leaf)
                    .map_err(|expected| ParamError::type_mismatch(&binding.path, expected))?;
            }
        }
        Ok(())
    }

    /// Paths of all bound parameters, in binding order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.bindings.iter().map(|b| b.path.as_str())
    }
}

// Setter-side extractors. Bindings are plain `fn` pointers, so call sites
// use these to keep the closures capture-free.

pub fn as_bool(value: &Value) -> Result<bool, &'static str> {
    value.as_bool().ok_or("bool")
}

pub fn as_u64(value: &Value) -> Result<u64, &'static str> {
    value.as_u64().ok_or("u64")
}

pub fn as_i64(value: &Value) -> Result<i64, &'static str> {
    value.as_i64().ok_or("i64")
}

pub fn as_f64(value: &Value) -> Result<f64, &'static str> {
    value.as_f64().ok_or("f64")
}

pub fn as_string(value: &Value) -> Result<String, &'static str> {
    value.as_str().map(str::to_owned).ok_or("string")
}

pub fn as_u64_vec(value: &Value) -> Result<Vec<u64>, &'static str> {
    let arr = value.as_array().ok_or("array of u64")?;
    arr.iter()
        .map(|v| v.as_u64().ok_or("array of u64"))
        .collect()
}

pub fn as_string_vec(value: &Value) -> Result<Vec<String>, &'static str> {
    let arr = value.as_array().ok_or("array of string")?;
    arr.iter()
        .map(|v| v.as_str().map(str::to_owned).ok_or("array of string"))
        .collect()
}
