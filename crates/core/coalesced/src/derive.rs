//! Key derivation from a callable and its positional arguments.
//!
//! Derived keys are a best-effort convenience. The name segment comes from
//! [`std::any::type_name`], whose format is not guaranteed by the compiler,
//! and closures have no name at all. Arguments are encoded with `serde_json`,
//! which does not canonicalise maps, so structurally different values may
//! encode identically. Prefer [`crate::Coalescer::execute`] with an explicit
//! key when collisions matter.

use std::{any::type_name, future::Future};

use serde::Serialize;

use crate::Error;

/// Positional argument list, implemented for tuples of up to eight [`Serialize`] values.
pub trait Args {
    /// Encode every argument, in order.
    fn encode(&self) -> Result<Vec<String>, Error>;
}

/// Async callable taking its arguments as a tuple.
pub trait Callable<A> {
    type Future: Future;

    fn call(self, args: A) -> Self::Future;
}

/// Name of a callable: the last path segment of its type name.
///
/// Closures and function pointers are anonymous and yield `""`.
pub fn fn_name<F: ?Sized>() -> &'static str {
    let segment = last_segment(type_name::<F>());

    if segment.starts_with('{') || segment.contains(['(', ')', ' ']) {
        ""
    } else {
        segment
    }
}

/// Build `name(arg1,arg2,...)` for a call of `func` with `args`.
pub fn make_key<F, A>(_func: &F, args: &A) -> Result<String, Error>
where
    F: ?Sized,
    A: Args,
{
    Ok(format!("{}({})", fn_name::<F>(), args.encode()?.join(",")))
}

fn last_segment(path: &str) -> &str {
    let bytes = path.as_bytes();
    let (mut start, mut end) = (0, path.len());
    let mut depth = 0usize;
    let mut index = 0;

    while index < bytes.len() {
        match bytes[index] {
            b'<' => {
                if depth == 0 {
                    end = index;
                }

                depth += 1;
            }
            b'>' => depth = depth.saturating_sub(1),
            b':' if depth == 0 && bytes.get(index + 1) == Some(&b':') => {
                start = index + 2;
                end = path.len();
                index += 1;
            }
            _ => {}
        }

        index += 1;
    }

    &path[start..end.max(start)]
}

fn encode_all(encoded: Vec<serde_json::Result<String>>) -> Result<Vec<String>, Error> {
    encoded
        .into_iter()
        .enumerate()
        .map(|(position, value)| {
            value.map_err(|error| Error::Encode {
                position,
                message: error.to_string(),
            })
        })
        .collect()
}

macro_rules! impl_args {
    ($($arg:ident),*) => {
        impl<$($arg: Serialize),*> Args for ($($arg,)*) {
            #[allow(non_snake_case)]
            fn encode(&self) -> Result<Vec<String>, Error> {
                let ($($arg,)*) = self;
                encode_all(vec![$(serde_json::to_string($arg)),*])
            }
        }

        impl<Func, Fut, $($arg),*> Callable<($($arg,)*)> for Func
        where
            Func: FnOnce($($arg),*) -> Fut,
            Fut: Future,
        {
            type Future = Fut;

            #[allow(non_snake_case)]
            fn call(self, args: ($($arg,)*)) -> Fut {
                let ($($arg,)*) = args;
                self($($arg),*)
            }
        }
    };
}

impl_args!();
impl_args!(A1);
impl_args!(A1, A2);
impl_args!(A1, A2, A3);
impl_args!(A1, A2, A3, A4);
impl_args!(A1, A2, A3, A4, A5);
impl_args!(A1, A2, A3, A4, A5, A6);
impl_args!(A1, A2, A3, A4, A5, A6, A7);
impl_args!(A1, A2, A3, A4, A5, A6, A7, A8);

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use super::*;
    use crate::Token;

    async fn add(a: String, b: i32) -> String {
        format!("{a}{b}")
    }

    async fn slow_add(a: String, b: i32) -> String {
        format!("{a}{b}")
    }

    async fn nothing() {}

    #[derive(Serialize)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn test_make_key() {
        assert_eq!(make_key(&add, &("1", 2)).unwrap(), r#"add("1",2)"#);
        assert_eq!(make_key(&slow_add, &("1", 2)).unwrap(), r#"slow_add("1",2)"#);
    }

    #[test]
    fn test_make_key_without_args() {
        assert_eq!(make_key(&nothing, &()).unwrap(), "nothing()");
    }

    #[test]
    fn test_make_key_structural_args() {
        let key = make_key(
            &add,
            &(true, 1.5, Point { x: 1, y: -2 }, vec!["a", "b"], Option::<u8>::None),
        )
        .unwrap();

        assert_eq!(key, r#"add(true,1.5,{"x":1,"y":-2},["a","b"],null)"#);
    }

    #[test]
    fn test_make_key_escapes_strings() {
        assert_eq!(make_key(&add, &("a\"b,c",)).unwrap(), r#"add("a\"b,c")"#);
    }

    #[test]
    fn test_anonymous_callables_collide() {
        let first = |a: i32| async move { a };
        let second = |a: i32| async move { a * 2 };

        assert_eq!(fn_name::<fn(i32) -> i32>(), "");
        assert_eq!(make_key(&first, &(1,)).unwrap(), "(1)");
        assert_eq!(make_key(&first, &(1,)).unwrap(), make_key(&second, &(1,)).unwrap());
    }

    #[test]
    fn test_unit_and_none_collide() {
        assert_eq!(
            make_key(&add, &((),)).unwrap(),
            make_key(&add, &(Option::<u8>::None,)).unwrap()
        );
    }

    #[test]
    fn test_unencodable_args() {
        let mut map = HashMap::new();
        map.insert((1, 2), "pair");

        assert!(matches!(
            make_key(&add, &("ok", map)),
            Err(Error::Encode { position: 1, .. })
        ));

        assert!(matches!(
            make_key(&add, &(Token::new(),)),
            Err(Error::Encode { position: 0, .. })
        ));
    }

    #[test]
    fn test_ordered_maps_are_deterministic() {
        let mut first = BTreeMap::new();
        first.insert("b", 2);
        first.insert("a", 1);

        let mut second = BTreeMap::new();
        second.insert("a", 1);
        second.insert("b", 2);

        assert_eq!(
            make_key(&add, &(first,)).unwrap(),
            make_key(&add, &(second,)).unwrap()
        );
    }

    #[test]
    fn test_last_segment() {
        assert_eq!(last_segment("slow_add"), "slow_add");
        assert_eq!(last_segment("crate::module::slow_add"), "slow_add");
        assert_eq!(last_segment("crate::fetch<alloc::string::String>"), "fetch");
        assert_eq!(last_segment("<T as crate::Trait>::method"), "method");
        assert_eq!(last_segment("crate::run::{{closure}}"), "{{closure}}");
        assert_eq!(last_segment("fn(alloc::string::String)"), "String)");

        assert_eq!(fn_name::<fn(String)>(), "");
        assert_eq!(fn_name::<fn(String) -> usize>(), "");
        assert_eq!(fn_name::<fn()>(), "");
    }

    #[tokio::test]
    async fn test_callable_spreads_args() {
        assert_eq!(Callable::call(add, ("1".to_owned(), 2)).await, "12");
        Callable::call(nothing, ()).await;
    }
}
