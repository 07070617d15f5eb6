//! A minimal configuration store: `lookup<T>(name, default, description) -> handle`,
//! `handle.get() -> T`, `handle.set(value)`, and `handle.subscribe(cb)`.
//!
//! This is deliberately small: no YAML binding, no type-erased variable registry, no
//! file watching. What's here is just enough for the two keys the runtime itself
//! consumes (`fiber.stack_size`, `tcp connect timeout`) to be read and hot-reloaded.

use std::sync::{Arc, Mutex, RwLock};

type Subscriber<T> = Box<dyn Fn(&T, &T) + Send + Sync>;

struct Inner<T> {
    value: RwLock<T>,
    name: &'static str,
    description: &'static str,
    subscribers: Mutex<Vec<Subscriber<T>>>,
}

/// A hot-reloadable configuration value.
#[derive(Clone)]
pub struct ConfigVar<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Clone + Send + Sync + 'static> ConfigVar<T> {
    pub fn get(&self) -> T {
        self.inner.value.read().unwrap().clone()
    }

    /// Updates the value and notifies subscribers with (old, new).
    pub fn set(&self, new_value: T) {
        let old = {
            let mut guard = self.inner.value.write().unwrap();
            std::mem::replace(&mut *guard, new_value.clone())
        };
        for cb in self.inner.subscribers.lock().unwrap().iter() {
            cb(&old, &new_value);
        }
    }

    pub fn subscribe(&self, cb: impl Fn(&T, &T) + Send + Sync + 'static) {
        self.inner.subscribers.lock().unwrap().push(Box::new(cb));
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }
}

/// Registers a named configuration value with its default and description.
pub fn lookup<T: Clone + Send + Sync + 'static>(
    name: &'static str,
    default_value: T,
    description: &'static str,
) -> ConfigVar<T> {
    ConfigVar {
        inner: Arc::new(Inner {
            value: RwLock::new(default_value),
            name,
            description,
            subscribers: Mutex::new(Vec::new()),
        }),
    }
}

lazy_static! {
    /// `fiber.stack_size`: default task stack, bytes.
    pub static ref FIBER_STACK_SIZE: ConfigVar<u32> =
        lookup("fiber.stack_size", 1024 * 1024, "fiber stack size");

    /// `tcp connect timeout`: default timeout for hooked `connect`, milliseconds.
    pub static ref TCP_CONNECT_TIMEOUT_MS: ConfigVar<i32> =
        lookup("tcp connect timeout", 5000, "default tcp connect timeout in ms");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_default_until_set() {
        let v = lookup("test.key", 42u32, "desc");
        assert_eq!(v.get(), 42);
        v.set(7);
        assert_eq!(v.get(), 7);
    }

    #[test]
    fn subscribers_see_old_and_new() {
        let v = lookup("test.key2", 1u32, "desc");
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        v.subscribe(move |old, new| {
            *seen2.lock().unwrap() = Some((*old, *new));
        });
        v.set(2);
        assert_eq!(*seen.lock().unwrap(), Some((1, 2)));
    }

    #[test]
    fn global_keys_have_expected_defaults() {
        assert_eq!(FIBER_STACK_SIZE.get(), 1024 * 1024);
        assert_eq!(TCP_CONNECT_TIMEOUT_MS.get(), 5000);
    }
}
