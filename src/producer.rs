//! User functions in their three arities, and the input view handed to
//! multi-precursor producers.

use std::fmt::{self, Debug, Formatter};
use std::ops::Index;

use crate::Key;

type NullaryFn<T> = Box<dyn Fn() -> anyhow::Result<T> + Send + Sync>;
type UnaryFn<T> = Box<dyn Fn(T) -> anyhow::Result<T> + Send + Sync>;
type GatheredFn<T> = Box<dyn Fn(&EvaluationInput<T>) -> anyhow::Result<T> + Send + Sync>;

/// A memory's producer function, together with its normalized source text
/// and declared precursor keys.
///
/// The source text is what gets fingerprinted, not the closure itself, so a
/// textually identical re-declaration revalidates the cache instead of
/// recomputing. Closure-captured values are invisible to the fingerprint;
/// producers that capture mutable state should be re-stored when that state
/// changes, or salted with [`with_source`][Producer::with_source].
///
/// Rust cannot reflect on closure parameters, so the binding mode is part of
/// the constructor:
/// - [`nullary`][Producer::nullary] for root memories, called as `f()`;
/// - [`unary`][Producer::unary] for one precursor, called as `f(content)`;
/// - [`gathered`][Producer::gathered] for any precursors, called as
///   `f(&EvaluationInput)`.
///
/// The [`producer!`][crate::producer!] macro recovers the named-argument
/// form: `producer!((a, b) => a + b)` declares precursors `a` and `b`,
/// captures the body text for fingerprinting, and binds each precursor's
/// content to a local of the same name.
pub struct Producer<T> {
    source: String,
    precursors: Vec<String>,
    body: ProducerBody<T>,
}

enum ProducerBody<T> {
    Nullary(NullaryFn<T>),
    Unary(UnaryFn<T>),
    Gathered(GatheredFn<T>),
}

impl<T> Producer<T> {
    /// A producer with no precursors.
    pub fn nullary(
        source: impl Into<String>,
        f: impl Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    ) -> Producer<T> {
        Producer {
            source: source.into(),
            precursors: Vec::new(),
            body: ProducerBody::Nullary(Box::new(f)),
        }
    }

    /// A producer with exactly one precursor, receiving its content by value.
    pub fn unary(
        precursor: impl Into<String>,
        source: impl Into<String>,
        f: impl Fn(T) -> anyhow::Result<T> + Send + Sync + 'static,
    ) -> Producer<T> {
        Producer {
            source: source.into(),
            precursors: vec![precursor.into()],
            body: ProducerBody::Unary(Box::new(f)),
        }
    }

    /// A producer receiving all precursor contents through an
    /// [`EvaluationInput`] view, in declared order.
    pub fn gathered<I, S>(
        precursors: I,
        source: impl Into<String>,
        f: impl Fn(&EvaluationInput<T>) -> anyhow::Result<T> + Send + Sync + 'static,
    ) -> Producer<T>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Producer {
            source: source.into(),
            precursors: precursors.into_iter().map(Into::into).collect(),
            body: ProducerBody::Gathered(Box::new(f)),
        }
    }

    /// Replaces the fingerprint source, for producers whose observable
    /// behavior depends on more than their body text.
    pub fn with_source(mut self, source: impl Into<String>) -> Producer<T> {
        self.source = source.into();
        self
    }

    /// The normalized text that represents this function in fingerprints.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Declared precursor keys, in order, duplicates included.
    pub fn precursor_names(&self) -> &[String] {
        &self.precursors
    }

    pub(crate) fn into_parts(self) -> (String, Vec<String>) {
        (self.source, self.precursors)
    }

    pub(crate) fn invoke(&self, inputs: EvaluationInput<T>) -> anyhow::Result<T> {
        match &self.body {
            ProducerBody::Nullary(f) => f(),
            ProducerBody::Unary(f) => f(inputs.into_sole()?),
            ProducerBody::Gathered(f) => f(&inputs),
        }
    }
}

impl<T> Debug for Producer<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("source", &self.source)
            .field("precursors", &self.precursors)
            .finish_non_exhaustive()
    }
}

/// The view of precursor contents handed to a gathered producer.
///
/// Offers mapping-style lookup (`inputs["a"]`, [`get`][EvaluationInput::get])
/// and the fallible [`require`][EvaluationInput::require] for use with `?`.
/// Entries keep the precursor declaration order.
#[derive(Debug)]
pub struct EvaluationInput<T> {
    entries: Vec<(Key, T)>,
}

impl<T> EvaluationInput<T> {
    pub(crate) fn new(entries: Vec<(Key, T)>) -> EvaluationInput<T> {
        EvaluationInput { entries }
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_str() == key)
            .map(|(_, content)| content)
    }

    /// Like [`get`][EvaluationInput::get], but clones the content and turns
    /// a missing key into an error a producer can propagate.
    pub fn require(&self, key: &str) -> anyhow::Result<T>
    where
        T: Clone,
    {
        self.get(key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no precursor content named \"{key}\""))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(k, content)| (k.as_str(), content))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn into_sole(mut self) -> anyhow::Result<T> {
        if self.entries.len() != 1 {
            anyhow::bail!(
                "a single-precursor function received {} inputs",
                self.entries.len()
            );
        }
        Ok(self.entries.pop().expect("length checked above").1)
    }
}

impl<T> Index<&str> for EvaluationInput<T> {
    type Output = T;

    fn index(&self, key: &str) -> &T {
        match self.get(key) {
            Some(content) => content,
            None => panic!("no precursor content named \"{key}\""),
        }
    }
}

/// Declares a [`Producer`] from function-like syntax.
///
/// The parameter list doubles as the precursor list, the body text becomes
/// the fingerprint source, and each precursor's content is bound to a local
/// named after it:
///
/// ```
/// # use pensieve::{producer, Pensieve};
/// let mut pensieve = Pensieve::<i64>::new();
/// pensieve.store("a", producer!(() => 1)).unwrap();
/// pensieve.store("b", producer!((a) => a + 2)).unwrap();
/// pensieve.store("c", producer!((a, b) => a + b)).unwrap();
/// assert_eq!(pensieve.recall("c").unwrap(), 4);
/// ```
///
/// Bodies are infallible expressions; producers that need to fail build a
/// [`Producer`] directly and return `Err` from the closure.
#[macro_export]
macro_rules! producer {
    (() => $body:expr) => {
        $crate::Producer::nullary(stringify!($body), move || Ok($body))
    };
    (($precursor:ident) => $body:expr) => {
        $crate::Producer::unary(
            stringify!($precursor),
            stringify!($body),
            move |$precursor| Ok($body),
        )
    };
    (($($precursor:ident),+ $(,)?) => $body:expr) => {
        $crate::Producer::gathered(
            [$(stringify!($precursor)),+],
            stringify!($body),
            move |inputs| {
                $(let $precursor = inputs.require(stringify!($precursor))?;)+
                Ok($body)
            },
        )
    };
}
