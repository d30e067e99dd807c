//! Result sinks: where an activated message delivers its method's return value.

use std::any::{Any, type_name};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::error::RuntimeError;
use crate::object::{Lockable, ObjRef};

pub type AnyValue = Box<dyn Any + Send + Sync>;

#[derive(Debug)]
pub enum ResultValue {
    Int(i64),
    /// Reference to a lockable object (an `ObjRef<T>`).
    Pointer(AnyValue),
    Value(AnyValue),
}

impl ResultValue {
    pub fn category(&self) -> &'static str {
        match self {
            ResultValue::Int(_) => "int",
            ResultValue::Pointer(_) => "pointer",
            ResultValue::Value(_) => "value",
        }
    }
}

pub trait ResultSink: Send + Sync {
    fn push(&mut self, value: ResultValue);
    fn peek(&self) -> Option<&ResultValue>;
    fn take(&mut self) -> Option<ResultValue>;
}

/// Holds the first value pushed into it.
#[derive(Debug, Default)]
pub struct OneShotResult {
    slot: Option<ResultValue>,
}

impl ResultSink for OneShotResult {
    fn push(&mut self, value: ResultValue) {
        if self.slot.is_some() {
            trace!(category = value.category(), "one-shot result already filled");
            return;
        }
        self.slot = Some(value);
    }

    fn peek(&self) -> Option<&ResultValue> {
        self.slot.as_ref()
    }

    fn take(&mut self) -> Option<ResultValue> {
        self.slot.take()
    }
}

pub type ResultHandle = ObjRef<dyn ResultSink>;

/// Produces a fresh sink for every message a proxy sends.
pub type ResultFactory = Arc<dyn Fn() -> ResultHandle + Send + Sync>;

pub fn result_handle<S: ResultSink + 'static>(sink: S) -> ResultHandle {
    let inner: Arc<RwLock<dyn ResultSink>> = Arc::new(RwLock::new(sink));
    ObjRef::from_arc(inner)
}

pub fn one_shot_result() -> ResultHandle {
    result_handle(OneShotResult::default())
}

pub fn one_shot_factory() -> ResultFactory {
    Arc::new(one_shot_result)
}

impl ObjRef<dyn ResultSink> {
    pub fn is_ready(&self) -> bool {
        self.read_lock().peek().is_some()
    }

    pub fn push_int(&self, value: i64) {
        self.write_lock().push(ResultValue::Int(value));
    }

    pub fn get_int(&self) -> Result<i64, RuntimeError> {
        match self.read_lock().peek() {
            Some(ResultValue::Int(v)) => Ok(*v),
            Some(other) => Err(RuntimeError::ResultCategory {
                expected: "int",
                found: other.category(),
            }),
            None => Err(RuntimeError::ResultPending),
        }
    }

    pub fn push_pointer<T: Send + Sync + 'static>(&self, obj: ObjRef<T>) {
        self.write_lock().push(ResultValue::Pointer(Box::new(obj)));
    }

    pub fn get_pointer<T: Send + Sync + 'static>(&self) -> Result<ObjRef<T>, RuntimeError> {
        match self.read_lock().peek() {
            Some(ResultValue::Pointer(p)) => p
                .downcast_ref::<ObjRef<T>>()
                .cloned()
                .ok_or(RuntimeError::ResultType(type_name::<T>())),
            Some(other) => Err(RuntimeError::ResultCategory {
                expected: "pointer",
                found: other.category(),
            }),
            None => Err(RuntimeError::ResultPending),
        }
    }

    pub fn push_value<V: Send + Sync + 'static>(&self, value: V) {
        self.write_lock().push(ResultValue::Value(Box::new(value)));
    }

    /// Move a generic value out of the sink. A mismatched value stays put.
    pub fn take_value<V: Send + Sync + 'static>(&self) -> Result<V, RuntimeError> {
        let mut sink = self.write_lock();
        match sink.take() {
            Some(ResultValue::Value(v)) => match v.downcast::<V>() {
                Ok(v) => Ok(*v),
                Err(v) => {
                    sink.push(ResultValue::Value(v));
                    Err(RuntimeError::ResultType(type_name::<V>()))
                }
            },
            Some(other) => {
                let found = other.category();
                sink.push(other);
                Err(RuntimeError::ResultCategory {
                    expected: "value",
                    found,
                })
            }
            None => Err(RuntimeError::ResultPending),
        }
    }
}

/// Conversion of a method's return value into what its message delivers.
pub trait IntoResult {
    /// `None` when there is nothing to deliver.
    fn into_result(self) -> Option<ResultValue>;
}

impl IntoResult for () {
    fn into_result(self) -> Option<ResultValue> {
        None
    }
}

macro_rules! int_results {
    ($($t:ty),*) => {
        $(
            impl IntoResult for $t {
                fn into_result(self) -> Option<ResultValue> {
                    Some(ResultValue::Int(i64::from(self)))
                }
            }
        )*
    };
}

// Values outside the int category's range are delivered as generic values.
macro_rules! wide_int_results {
    ($($t:ty),*) => {
        $(
            impl IntoResult for $t {
                fn into_result(self) -> Option<ResultValue> {
                    Some(match i64::try_from(self) {
                        Ok(v) => ResultValue::Int(v),
                        Err(_) => ResultValue::Value(Box::new(self)),
                    })
                }
            }
        )*
    };
}

int_results!(bool, i8, i16, i32, i64, u8, u16, u32);
wide_int_results!(isize, u64, usize);

impl<T: Send + Sync + 'static> IntoResult for ObjRef<T> {
    fn into_result(self) -> Option<ResultValue> {
        Some(ResultValue::Pointer(Box::new(self)))
    }
}

/// Marks a return value delivered through the generic category.
#[derive(Clone, Debug, PartialEq)]
pub struct Value<V>(pub V);

impl<V: Send + Sync + 'static> IntoResult for Value<V> {
    fn into_result(self) -> Option<ResultValue> {
        Some(ResultValue::Value(Box::new(self.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_until_pushed() {
        let r = one_shot_result();
        assert_eq!(r.get_int(), Err(RuntimeError::ResultPending));
        r.push_int(42);
        assert_eq!(r.get_int(), Ok(42));
        r.push_int(7);
        assert_eq!(r.get_int(), Ok(42));
    }

    #[test]
    fn categories_are_checked() {
        let r = one_shot_result();
        r.push_value(String::from("done"));
        assert!(matches!(
            r.get_int(),
            Err(RuntimeError::ResultCategory { expected: "int", found: "value" })
        ));
        assert!(r.take_value::<u8>().is_err());
        assert_eq!(r.take_value::<String>().unwrap(), "done");
        assert!(!r.is_ready());
    }

    #[test]
    fn pointers_come_back_as_the_same_object() {
        let obj = ObjRef::new(vec![1, 2, 3]);
        let r = one_shot_result();
        r.push_pointer(obj.clone());
        let back = r.get_pointer::<Vec<i32>>().unwrap();
        assert!(back.ptr_eq(&obj));
        assert!(r.get_pointer::<String>().is_err());
    }

    #[test]
    fn wide_unsigned_results_do_not_wrap() {
        let r = one_shot_result();
        r.write_lock().push(7u64.into_result().unwrap());
        assert_eq!(r.get_int(), Ok(7));

        let big = one_shot_result();
        big.write_lock().push(u64::MAX.into_result().unwrap());
        assert!(big.get_int().is_err());
        assert_eq!(big.take_value::<u64>().unwrap(), u64::MAX);
    }

    #[test]
    fn factory_makes_independent_sinks() {
        let factory = one_shot_factory();
        let a = factory();
        let b = factory();
        a.push_int(1);
        assert!(!b.is_ready());
    }
}
