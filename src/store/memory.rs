use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    Contest, ContestQuestion, ProvisioningRecord, Question, QuestionCatalog, RecordStore, Team,
    TeamDirectory,
};
use crate::core::vm::{ContestId, ProvisioningKey, QuestionId, TeamId};
use crate::errors::{StoreError, StoreResult};

#[derive(Debug, Default)]
struct State {
    contests: HashMap<ContestId, Contest>,
    teams: HashMap<TeamId, Team>,
    questions: HashMap<QuestionId, Question>,
    contest_teams: HashMap<ContestId, BTreeSet<TeamId>>,
    contest_questions: HashMap<ContestId, BTreeMap<QuestionId, u32>>,
    records: BTreeMap<ProvisioningKey, ProvisioningRecord>,
}

/// Store backed by process memory. Used when no database is configured
/// and by the test suite.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_contest(&self, contest: Contest) {
        self.state.write().await.contests.insert(contest.id, contest);
    }

    pub async fn add_team(&self, team: Team) {
        self.state.write().await.teams.insert(team.id, team);
    }

    pub async fn add_question(&self, question: Question) {
        self.state
            .write()
            .await
            .questions
            .insert(question.id, question);
    }

    pub async fn assign_team(&self, contest_id: ContestId, team_id: TeamId) {
        self.state
            .write()
            .await
            .contest_teams
            .entry(contest_id)
            .or_default()
            .insert(team_id);
    }

    pub async fn assign_question(&self, contest_id: ContestId, question_id: QuestionId, point: u32) {
        self.state
            .write()
            .await
            .contest_questions
            .entry(contest_id)
            .or_default()
            .insert(question_id, point);
    }

    pub async fn record_count(&self) -> usize {
        self.state.read().await.records.len()
    }
}

#[async_trait]
impl TeamDirectory for MemoryStore {
    async fn contest_teams(&self, contest_id: ContestId) -> StoreResult<Vec<Team>> {
        let state = self.state.read().await;
        let teams = state
            .contest_teams
            .get(&contest_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.teams.get(id).cloned())
            .collect();
        Ok(teams)
    }
}

#[async_trait]
impl QuestionCatalog for MemoryStore {
    async fn contest(&self, contest_id: ContestId) -> StoreResult<Option<Contest>> {
        Ok(self.state.read().await.contests.get(&contest_id).cloned())
    }

    async fn contest_questions(&self, contest_id: ContestId) -> StoreResult<Vec<ContestQuestion>> {
        let state = self.state.read().await;
        let questions = state
            .contest_questions
            .get(&contest_id)
            .into_iter()
            .flatten()
            .filter_map(|(id, point)| {
                state.questions.get(id).map(|question| ContestQuestion {
                    question: question.clone(),
                    point: *point,
                })
            })
            .collect();
        Ok(questions)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn record(&self, key: &ProvisioningKey) -> StoreResult<Option<ProvisioningRecord>> {
        Ok(self.state.read().await.records.get(key).cloned())
    }

    async fn insert_record(&self, record: &ProvisioningRecord) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.records.contains_key(&record.key) {
            return Err(StoreError::DuplicateRecord(record.key));
        }
        state.records.insert(record.key, record.clone());
        Ok(())
    }

    async fn delete_record(&self, key: &ProvisioningKey) -> StoreResult<bool> {
        Ok(self.state.write().await.records.remove(key).is_some())
    }

    async fn records_by_contest(
        &self,
        contest_id: ContestId,
    ) -> StoreResult<Vec<ProvisioningRecord>> {
        let state = self.state.read().await;
        Ok(state
            .records
            .values()
            .filter(|record| record.key.contest_id == contest_id)
            .cloned()
            .collect())
    }
}
