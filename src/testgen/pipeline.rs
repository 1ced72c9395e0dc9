//! testgen/pipeline.rs
//!
//! Generate -> execute -> evaluate -> reprompt controller.
//!
//! Each run walks `Init -> Sampling -> Executing -> (Summarizing) ->
//! Evaluating` and ends in `Accepted`, `Exhausted`, or a fatal abort.
//! `max_iter` bounds reprompt cycles; a multi-sample cycle still counts once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{CompletionError, ConfigError, FatalError, RunAborted};
use crate::llm::client::Completer;
use crate::llm::prompt::{build_prompt, feedback_prompt};
use crate::persistence::TestRecordStore;
use crate::sandbox::TestExecutor;
use crate::session::Session;
use crate::state::{
    Candidate, ExecutionResult, GenerationConfig, LogLevel, Phase, PipelineEvent, Role,
    TargetObject, TestRecord, TokenUsage, Verdict,
};
use crate::testgen::aggregator::{execute, SampleAggregator};
use crate::testgen::extract::postprocess;

#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// How the run opens the conversation.
#[derive(Debug, Clone)]
pub enum Kickoff {
    /// Describe the target. The system prompt is added only to an empty session.
    Fresh,
    /// Continue an existing conversation with a user instruction.
    FollowUp(String),
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub verdict: Verdict,
    pub test_source: String,
    pub result: ExecutionResult,
    pub iterations: u32,
    pub usage: TokenUsage,
    pub record: TestRecord,
    pub persisted: bool,
}

struct RunState {
    phase: Phase,
    iteration: u32,
    last_result: Option<ExecutionResult>,
    usage: TokenUsage,
}

pub struct Pipeline<'a> {
    client: &'a dyn Completer,
    executor: &'a dyn TestExecutor,
    store: Option<&'a TestRecordStore>,
    config: GenerationConfig,
    persist_failures: bool,
    cancel: CancelToken,
    events: Option<Sender<PipelineEvent>>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        client: &'a dyn Completer,
        executor: &'a dyn TestExecutor,
        config: GenerationConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            client,
            executor,
            store: None,
            config,
            persist_failures: false,
            cancel: CancelToken::new(),
            events: None,
        })
    }

    pub fn with_store(mut self, store: &'a TestRecordStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn persist_failures(mut self, yes: bool) -> Self {
        self.persist_failures = yes;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, tx: Sender<PipelineEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub fn run(
        &self,
        session: &mut Session,
        target: &TargetObject,
        kickoff: Kickoff,
    ) -> Result<PipelineOutcome, RunAborted> {
        let mut st = RunState {
            phase: Phase::Init,
            iteration: 0,
            last_result: None,
            usage: TokenUsage::default(),
        };

        info!(
            target = %target.id(),
            model = %self.config.model_id,
            n_samples = self.config.n_samples,
            max_iter = self.config.max_iter,
            "generation started"
        );
        self.transition(&mut st, Phase::Init);
        self.init_session(session, target, &kickoff);
        st.iteration = 1;

        loop {
            self.check_cancel(&st, session)?;
            self.transition(&mut st, Phase::Sampling);

            let completion = self
                .client
                .complete(session.messages(), &self.config)
                .map_err(|e| self.abort(&st, session, e.into()))?;
            st.usage.add(completion.usage);

            let candidates: Vec<Candidate> = completion
                .texts
                .iter()
                .enumerate()
                .map(|(i, text)| Candidate {
                    sample_index: i,
                    source: postprocess(text, target),
                })
                .collect();
            if candidates.is_empty() {
                let e = CompletionError::MalformedResponse("no completions returned".into());
                return Err(self.abort(&st, session, e.into()));
            }

            if self.config.n_samples == 1 {
                self.push(session, Role::Assistant, candidates[0].source.clone());
            }

            self.check_cancel(&st, session)?;
            self.transition(&mut st, Phase::Executing);

            let (source, result) = if self.config.n_samples == 1 {
                let source = candidates[0].source.clone();
                let result = execute(self.executor, &source, target)
                    .map_err(|e| self.abort(&st, session, e.into()))?;
                (source, result)
            } else {
                self.consolidate(&mut st, session, target, &candidates)?
            };

            st.last_result = Some(result.clone());
            self.emit(PipelineEvent::IterationFinished {
                iteration: st.iteration,
                result: result.clone(),
            });

            self.check_cancel(&st, session)?;
            self.transition(&mut st, Phase::Evaluating);

            if result.passed {
                self.transition(&mut st, Phase::Accepted);
                return self.finish(&st, session, target, Verdict::Accepted, source, result);
            }

            if st.iteration >= self.config.max_iter {
                self.transition(&mut st, Phase::Exhausted);
                return self.finish(&st, session, target, Verdict::Exhausted, source, result);
            }

            self.transition(&mut st, Phase::Retry);
            self.push(session, Role::User, feedback_prompt(&result));
            st.iteration += 1;
        }
    }

    fn init_session(&self, session: &mut Session, target: &TargetObject, kickoff: &Kickoff) {
        let fresh = |session: &mut Session| {
            let prompt = build_prompt(target);
            if !session.has_system_prompt() {
                self.push(session, Role::System, prompt.system);
            }
            self.push(session, Role::User, prompt.user);
        };

        match kickoff {
            Kickoff::Fresh => fresh(session),
            Kickoff::FollowUp(text) => {
                if session.is_empty() {
                    fresh(session);
                }
                if !text.trim().is_empty() {
                    self.push(session, Role::User, text.clone());
                }
            }
        }
    }

    /// Executes all samples, asks for one consolidated answer and executes
    /// that. The consolidated result is authoritative for the iteration.
    fn consolidate(
        &self,
        st: &mut RunState,
        session: &mut Session,
        target: &TargetObject,
        candidates: &[Candidate],
    ) -> Result<(String, ExecutionResult), RunAborted> {
        let (results, summary) = SampleAggregator::evaluate(candidates, self.executor, target)
            .map_err(|e| self.abort(st, session, e.into()))?;

        for (c, r) in candidates.iter().zip(&results) {
            self.emit(PipelineEvent::SampleExecuted {
                sample_index: c.sample_index,
                source: c.source.clone(),
                passed: r.passed,
            });
        }
        st.last_result = results.last().cloned();

        self.check_cancel(st, session)?;
        self.transition(st, Phase::Summarizing);
        self.push(session, Role::User, summary);

        let completion = self
            .client
            .complete(session.messages(), &self.config.single_sample())
            .map_err(|e| self.abort(st, session, e.into()))?;
        st.usage.add(completion.usage);

        let Some(text) = completion.texts.first() else {
            let e = CompletionError::MalformedResponse("no consolidated completion returned".into());
            return Err(self.abort(st, session, e.into()));
        };
        let source = postprocess(text, target);
        self.push(session, Role::Assistant, source.clone());

        let result = execute(self.executor, &source, target)
            .map_err(|e| self.abort(st, session, e.into()))?;
        Ok((source, result))
    }

    fn finish(
        &self,
        st: &RunState,
        session: &Session,
        target: &TargetObject,
        verdict: Verdict,
        test_source: String,
        result: ExecutionResult,
    ) -> Result<PipelineOutcome, RunAborted> {
        let accepted = verdict == Verdict::Accepted;
        let record = TestRecord {
            id: Uuid::new_v4().to_string(),
            object_id: target.id(),
            target: target.clone(),
            test_source: test_source.clone(),
            result: result.clone(),
            iteration_count: st.iteration,
            accepted,
            messages: session.snapshot(),
            model_id: self.config.model_id.clone(),
            created_at: Utc::now(),
        };

        let mut persisted = false;
        if accepted || self.persist_failures {
            if let Some(store) = self.store {
                store
                    .create(&record)
                    .map_err(|e| self.abort(st, session, e.into()))?;
                persisted = true;
            }
        }

        if accepted {
            info!(target = %record.object_id, iterations = st.iteration, "test accepted");
            self.emit(PipelineEvent::Log(
                LogLevel::Success,
                format!("Test accepted after {} iteration(s)", st.iteration),
            ));
        } else {
            warn!(target = %record.object_id, iterations = st.iteration, "iteration budget exhausted");
            self.emit(PipelineEvent::Log(
                LogLevel::Warn,
                format!("No passing test after {} iteration(s)", st.iteration),
            ));
        }
        self.emit(PipelineEvent::Finished(verdict));

        Ok(PipelineOutcome {
            verdict,
            test_source,
            result,
            iterations: st.iteration,
            usage: st.usage,
            record,
            persisted,
        })
    }

    fn check_cancel(&self, st: &RunState, session: &Session) -> Result<(), RunAborted> {
        if self.cancel.is_cancelled() {
            return Err(self.abort(st, session, FatalError::Cancelled));
        }
        Ok(())
    }

    fn abort(&self, st: &RunState, session: &Session, cause: FatalError) -> RunAborted {
        warn!(phase = ?st.phase, iteration = st.iteration, error = %cause, "generation aborted");
        self.emit(PipelineEvent::Aborted(cause.to_string()));
        RunAborted {
            phase: st.phase,
            iteration: st.iteration,
            cause,
            messages: session.snapshot(),
            last_result: st.last_result.clone(),
            usage: st.usage,
        }
    }

    fn transition(&self, st: &mut RunState, next: Phase) {
        st.phase = next;
        self.emit(PipelineEvent::PhaseChanged {
            phase: next,
            iteration: st.iteration,
        });
    }

    fn push(&self, session: &mut Session, role: Role, content: String) {
        let msg = session.append(role, content).clone();
        self.emit(PipelineEvent::MessageAppended(msg));
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}
