use std::cmp::Ordering;
use std::sync::Arc;

use crate::conditions::matches_template;
use crate::domain::document::Document;
use crate::domain::workflow::WorkflowTemplate;
use crate::errors::EngineError;
use crate::store::WorkflowStore;

/// Picks the workflow template that should route a submitted document.
///
/// Conditioned templates are tried before the owner's default so a specific
/// trigger always beats the catch-all; the default is the fallback when no
/// trigger matches.
pub struct WorkflowSelector<S> {
    store: Arc<S>,
}

impl<S> WorkflowSelector<S>
where
    S: WorkflowStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn select(
        &self,
        owner_id: &str,
        document: &Document,
    ) -> Result<Option<WorkflowTemplate>, EngineError> {
        let mut templates: Vec<WorkflowTemplate> = self
            .store
            .templates_for_owner(owner_id)
            .await?
            .into_iter()
            .filter(|template| template.is_active)
            .collect();

        templates.sort_by(|left, right| {
            defaults_last(left, right).then_with(|| left.name.cmp(&right.name))
        });

        if let Some(matched) =
            templates.iter().find(|template| matches_template(template, document))
        {
            return Ok(Some(matched.clone()));
        }

        Ok(templates.into_iter().find(|template| template.is_default))
    }
}

fn defaults_last(left: &WorkflowTemplate, right: &WorkflowTemplate) -> Ordering {
    left.is_default.cmp(&right.is_default)
}
