use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::path::Path;
use std::rc::Rc;

use ndarray::prelude::*;

use crate::error::Result;

pub mod optimization;
pub mod reward;
pub mod serialization;
pub mod vocabulary;

/// A named array of weights. Models and the optimizers that update them hold
/// the same `Rc<Parameter>`, so a step is visible to the next generation.
pub struct Parameter {
    identifier: String,
    array: RefCell<ArrayD<f32>>,
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("identifier", &self.identifier)
            .field("shape", &self.array.borrow().shape())
            .finish()
    }
}

impl Parameter {
    pub fn new(identifier: &str, array: ArrayD<f32>) -> Rc<Self> {
        Rc::new(Self {
            identifier: identifier.to_owned(),
            array: RefCell::new(array),
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn borrow_array(&self) -> Ref<ArrayD<f32>> {
        self.array.borrow()
    }

    pub fn borrow_array_mut(&self) -> RefMut<ArrayD<f32>> {
        self.array.borrow_mut()
    }
}

pub trait Parameterized {
    fn identifier(&self) -> &str;
    fn parameters(&self) -> Vec<Rc<Parameter>>;

    fn parameter_count(&self) -> usize {
        self.parameters()
            .iter()
            .map(|parameter| parameter.borrow_array().len())
            .sum()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GenerationParameters {
    pub max_new_tokens: usize,
    /// Greedy decoding when false; `temperature` and `top_p` are then ignored.
    pub sample: bool,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            max_new_tokens: 50,
            sample: true,
            temperature: 1.0,
            top_p: 1.0,
        }
    }
}

/// Produces continuations of a prompt. Returned strings never include the
/// prompt itself and may be empty.
pub trait Generator {
    fn generate(
        &mut self,
        prompt: &str,
        parameters: &GenerationParameters,
        count: usize,
    ) -> Result<Vec<String>>;
}

pub trait Scorer {
    fn score(&self, text: &str, max_length: usize) -> Result<f32>;
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepStatistics {
    pub reward: f32,
    pub kl_divergence: f32,
    pub log_probability: f32,
    pub update_norm: f32,
}

pub trait Optimizer {
    fn step(
        &mut self,
        prompt_ids: &[usize],
        response_ids: &[usize],
        reward: f32,
    ) -> Result<StepStatistics>;
    fn step_count(&self) -> usize;
    fn save(&self, path: &Path) -> Result<()>;
}
