//! Compiles merged traffic policies into Istio routing configuration.
//!
//! Each destination is translated independently into at most one
//! `VirtualService`, plus the `DestinationRule` subsets its routes refer to.
//! Istio evaluates routes in order and the first match wins, so routes are
//! ordered by specificity rather than by the order policies were authored.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod actions;
mod matches;
mod order;
mod translate;


pub use self::translate::{
    DestinationRuleSubsetUpdate, PolicyTranslatorError, Translation, Translator, TranslatorError,
    TRANSLATOR_ID,
};
