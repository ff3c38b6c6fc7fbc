//! Composite controller whose spec lists its child components verbatim.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{decode_document, Controller, ControllerContext, Lifecycle, RenderedComponent, Renderer};
use crate::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupSpec {
    #[serde(default)]
    pub components: Vec<RenderedComponent>,
}

/// Renders `spec.components` as children. Holds no resources of its own.
#[derive(Debug, Default)]
pub struct GroupController {
    spec: GroupSpec,
}

impl Controller for GroupController {
    fn hydrate(&mut self, spec: &str, _state: &str) -> Result<()> {
        self.spec = decode_document("group spec", spec)?;
        Ok(())
    }

    fn marshal_state(&self) -> Result<String> {
        Ok("{}".to_string())
    }

    fn as_lifecycle(&mut self) -> Option<&mut dyn Lifecycle> {
        Some(self)
    }

    fn as_renderer(&mut self) -> Option<&mut dyn Renderer> {
        Some(self)
    }
}

#[async_trait]
impl Lifecycle for GroupController {
    async fn initialize(&mut self, _ctx: &ControllerContext) -> Result<()> {
        Ok(())
    }

    async fn refresh(&mut self, _ctx: &ControllerContext) -> Result<()> {
        Ok(())
    }

    async fn dispose(&mut self, _ctx: &ControllerContext) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Renderer for GroupController {
    async fn render(&mut self, _ctx: &ControllerContext) -> Result<Vec<RenderedComponent>> {
        Ok(self.spec.components.clone())
    }
}
