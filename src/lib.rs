// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs, unsafe_code)]

#[cfg(feature = "adaptive")]
mod adaptive;
mod macros;
#[cfg(feature = "numa")]
mod numa;
mod util;
mod work_share;
mod worker;

#[cfg(feature = "numa")]
pub use numa::NumaTopology;
pub use util::{Span, Steps};
pub use work_share::{Schedule, WorkShare};
pub use worker::{StaticNext, Worker};
