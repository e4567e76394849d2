use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn get_window(&self, window_id: Ulid) -> Result<TimeWindow, EngineError> {
        let resource_id = self
            .get_resource_for_window(&window_id)
            .ok_or(EngineError::NotFound(window_id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        guard
            .window(&window_id)
            .cloned()
            .ok_or(EngineError::NotFound(window_id))
    }

    /// Every window on `date`, any status, ordered by start time.
    pub async fn windows_on(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<TimeWindow>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(guard.windows_on(date).to_vec())
    }

    /// Claimable timeslots on `date`.
    pub async fn available_on(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<TimeWindow>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(guard
            .windows_on(date)
            .iter()
            .filter(|w| w.is_available())
            .cloned()
            .collect())
    }

    pub async fn answers_for(&self, window_id: Ulid) -> Result<Vec<Answer>, EngineError> {
        let resource_id = self
            .get_resource_for_window(&window_id)
            .ok_or(EngineError::NotFound(window_id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(guard.answers.get(&window_id).cloned().unwrap_or_default())
    }

    /// Bookings held by `claimant` whose window falls on `date`, case-insensitive.
    pub async fn bookings_of(
        &self,
        claimant: &str,
        date: NaiveDate,
    ) -> Result<Vec<TimeWindow>, EngineError> {
        let ids: Vec<Ulid> = self
            .indexes
            .claims_per_day
            .get(&(claimant.trim().to_lowercase(), date))
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.get_window(id).await?);
        }
        out.sort_by_key(|w| (w.span.start, w.id));
        Ok(out)
    }

    /// Pending, approved and completed claims by `claimant` on `date`.
    pub fn claims_on(&self, claimant: &str, date: NaiveDate) -> usize {
        self.indexes
            .claims_per_day
            .get(&(claimant.trim().to_lowercase(), date))
            .map(|ids| ids.len())
            .unwrap_or(0)
    }

    pub async fn resource_info(&self, resource_id: Ulid) -> Result<ResourceInfo, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(ResourceInfo {
            id: guard.id,
            name: guard.name.clone(),
            managers: guard.managers.iter().cloned().collect(),
            questions: guard.questions.clone(),
        })
    }

    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let mut ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(info) = self.resource_info(id).await {
                out.push(info);
            }
        }
        out
    }

    pub(crate) fn token(&self, digest: &str) -> Option<ActionToken> {
        self.tokens.get(digest).map(|t| t.value().clone())
    }

    /// Whether the token behind this raw value can still be redeemed.
    pub fn token_is_live(&self, raw_token: &str) -> bool {
        let digest = crate::tokens::digest(raw_token.trim());
        let now = self.now();
        self.tokens
            .get(&digest)
            .is_some_and(|t| !t.used && !t.is_expired(now))
    }
}
