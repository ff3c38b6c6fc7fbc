//! Placeholder controller for components whose type could not be constructed.

use async_trait::async_trait;

use super::{Controller, ControllerContext, Lifecycle, Process, RenderedComponent, Renderer};
use crate::{Error, Result};

/// Carries a construction error and reports it from every capability.
#[derive(Debug, Clone)]
pub struct InvalidController {
    type_: String,
    message: String,
    state: String,
}

impl InvalidController {
    pub fn new<T: Into<String>, M: Into<String>>(type_: T, message: M) -> Self {
        Self {
            type_: type_.into(),
            message: message.into(),
            state: String::new(),
        }
    }

    fn err(&self) -> Error {
        Error::ControllerConstruction {
            type_: self.type_.clone(),
            message: self.message.clone(),
        }
    }
}

impl Controller for InvalidController {
    fn hydrate(&mut self, _spec: &str, state: &str) -> Result<()> {
        // Stored state is opaque here and is written back untouched.
        self.state = state.to_string();
        Ok(())
    }

    fn marshal_state(&self) -> Result<String> {
        if self.state.is_empty() {
            return Ok("{}".to_string());
        }
        Ok(self.state.clone())
    }

    fn as_lifecycle(&mut self) -> Option<&mut dyn Lifecycle> {
        Some(self)
    }

    fn as_process(&mut self) -> Option<&mut dyn Process> {
        Some(self)
    }

    fn as_renderer(&mut self) -> Option<&mut dyn Renderer> {
        Some(self)
    }
}

#[async_trait]
impl Lifecycle for InvalidController {
    async fn initialize(&mut self, _ctx: &ControllerContext) -> Result<()> {
        Err(self.err())
    }

    async fn refresh(&mut self, _ctx: &ControllerContext) -> Result<()> {
        Err(self.err())
    }

    async fn dispose(&mut self, _ctx: &ControllerContext) -> Result<()> {
        Err(self.err())
    }
}

#[async_trait]
impl Process for InvalidController {
    async fn start(&mut self, _ctx: &ControllerContext) -> Result<()> {
        Err(self.err())
    }

    async fn stop(&mut self, _ctx: &ControllerContext) -> Result<()> {
        Err(self.err())
    }
}

#[async_trait]
impl Renderer for InvalidController {
    async fn render(&mut self, _ctx: &ControllerContext) -> Result<Vec<RenderedComponent>> {
        Err(self.err())
    }
}
