use std::{
    hash::{Hash, Hasher},
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{ser::Error as _, Serialize, Serializer};

use crate::Error;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(0);

/// Unique, unforgeable key component.
///
/// Every call to [`Token::new`] yields a token that compares unequal to every
/// other token ever created. Clones compare equal to their origin.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Token(u64);

impl Token {
    pub fn new() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}

/// Tokens have no structural encoding, so they cannot take part in derived keys.
impl Serialize for Token {
    fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        Err(S::Error::custom("tokens cannot be encoded"))
    }
}

/// Key identifying a unit of work in a [`crate::Coalescer`].
///
/// Numbers compare by value with `-0.0 == 0.0` and `NaN == NaN`, so any
/// number can be used as a key. 64-bit and pointer-sized integers only
/// convert through `TryFrom`, which rejects values an `f64` cannot hold
/// exactly; use them directly as the coalescer's key type instead when ids
/// may exceed 2^53.
#[derive(Clone, Debug)]
pub enum Key {
    Text(String),
    Number(f64),
    Token(Token),
}

fn number_bits(value: f64) -> u64 {
    if value.is_nan() {
        f64::NAN.to_bits()
    } else if value == 0.0 {
        0
    } else {
        value.to_bits()
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Key::Text(a), Key::Text(b)) => a == b,
            (Key::Number(a), Key::Number(b)) => number_bits(*a) == number_bits(*b),
            (Key::Token(a), Key::Token(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);

        match self {
            Key::Text(text) => text.hash(state),
            Key::Number(value) => number_bits(*value).hash(state),
            Key::Token(token) => token.hash(state),
        }
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Text(value)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Text(value.to_owned())
    }
}

impl From<Token> for Key {
    fn from(value: Token) -> Self {
        Key::Token(value)
    }
}

impl From<&Token> for Key {
    fn from(value: &Token) -> Self {
        Key::Token(value.clone())
    }
}

macro_rules! number_key {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Key {
                fn from(value: $ty) -> Self {
                    Key::Number(f64::from(value))
                }
            }
        )*
    };
}

macro_rules! wide_number_key {
    ($($ty:ty),*) => {
        $(
            impl TryFrom<$ty> for Key {
                type Error = Error;

                fn try_from(value: $ty) -> Result<Self, Error> {
                    let number = value as f64;

                    if number as i128 == value as i128 {
                        Ok(Key::Number(number))
                    } else {
                        Err(Error::InexactNumber(value as i128))
                    }
                }
            }
        )*
    };
}

number_key!(f32, f64, i8, i16, i32, u8, u16, u32);
wide_number_key!(i64, u64, isize, usize);
