// Archivo: command.rs
// Propósito: conjunto cerrado de comandos que un paso devuelve al motor.
//
// Los comandos de ciclo de vida (`Transit`, `Pause`, `Resume`, `End`) mutan
// su `StateCtx` con `apply`; fuera de un `Commit` esa mutación es local y
// no se persiste. Los comandos de consulta guardan su respuesta en
// `result`.
use crate::annotations;
use crate::domain::{Annotations, Data, DelayedState, FlowId, Labels, State, StateCtx, StateId, Transition};
use crate::errors::{FlowError, Result};
use crate::repository::{GetDelayedQuery, GetDelayedResult, GetStatesQuery, GetStatesResult};
use crate::clock;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Command {
    Transit(TransitCommand),
    Pause(PauseCommand),
    Resume(ResumeCommand),
    End(EndCommand),
    CommitStateCtx(CommitStateCtxCommand),
    Delay(DelayCommand),
    Execute(ExecuteCommand),
    Noop,
    Stack(StackCommand),
    Unstack(UnstackCommand),
    StoreData(StoreDataCommand),
    GetData(GetDataCommand),
    ReferenceData(ReferenceDataCommand),
    DereferenceData(DereferenceDataCommand),
    GetStateById(GetStateByIdCommand),
    GetStateByLabels(GetStateByLabelsCommand),
    GetStates(GetStatesCommand),
    GetDelayedStates(GetDelayedStatesCommand),
    Commit(CommitCommand),
}

impl Command {
    pub fn transit(state_ctx: StateCtx, to: impl Into<FlowId>) -> Command {
        TransitCommand::new(state_ctx, to).into()
    }

    pub fn pause(state_ctx: StateCtx) -> Command {
        PauseCommand::new(state_ctx).into()
    }

    pub fn resume(state_ctx: StateCtx) -> Command {
        ResumeCommand::new(state_ctx).into()
    }

    pub fn end(state_ctx: StateCtx) -> Command {
        EndCommand::new(state_ctx).into()
    }

    pub fn commit_state_ctx(state_ctx: StateCtx) -> Command {
        Command::CommitStateCtx(CommitStateCtxCommand { state_ctx })
    }

    pub fn delay(state_ctx: StateCtx, duration: Duration) -> Command {
        DelayCommand::new(state_ctx, duration).into()
    }

    pub fn execute(state_ctx: StateCtx) -> Command {
        Command::Execute(ExecuteCommand { state_ctx })
    }

    pub fn noop() -> Command {
        Command::Noop
    }

    pub fn stack(carrier: StateCtx, stacked: StateCtx) -> Command {
        StackCommand::new(carrier, stacked).into()
    }

    pub fn unstack(carrier: StateCtx) -> Command {
        UnstackCommand::new(carrier).into()
    }

    pub fn store_data(data: Data) -> Command {
        Command::StoreData(StoreDataCommand { data })
    }

    pub fn get_data(id: impl Into<crate::domain::DataId>, rev: i64) -> Command {
        Command::GetData(GetDataCommand { data: Data::reference(id, rev) })
    }

    pub fn reference_data(state_ctx: StateCtx, data: Data, annotation: impl Into<String>) -> Command {
        Command::ReferenceData(ReferenceDataCommand { state_ctx,
                                                      data,
                                                      annotation: annotation.into() })
    }

    pub fn dereference_data(state_ctx: StateCtx, annotation: impl Into<String>) -> Command {
        Command::DereferenceData(DereferenceDataCommand { state_ctx,
                                                          annotation: annotation.into(),
                                                          data: None })
    }

    pub fn get_state_by_id(id: impl Into<StateId>, rev: i64) -> Command {
        Command::GetStateById(GetStateByIdCommand { id: id.into(),
                                                    rev,
                                                    result: None })
    }

    pub fn get_state_by_labels(labels: Labels) -> Command {
        Command::GetStateByLabels(GetStateByLabelsCommand { labels, result: None })
    }

    pub fn get_states(query: GetStatesQuery) -> Command {
        Command::GetStates(GetStatesCommand { query, result: None })
    }

    pub fn get_delayed_states(query: GetDelayedQuery) -> Command {
        Command::GetDelayedStates(GetDelayedStatesCommand { query, result: None })
    }

    pub fn commit(commands: impl IntoIterator<Item = Command>) -> Command {
        Command::Commit(CommitCommand::new(commands))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Transit(_) => "transit",
            Command::Pause(_) => "pause",
            Command::Resume(_) => "resume",
            Command::End(_) => "end",
            Command::CommitStateCtx(_) => "commit_state_ctx",
            Command::Delay(_) => "delay",
            Command::Execute(_) => "execute",
            Command::Noop => "noop",
            Command::Stack(_) => "stack",
            Command::Unstack(_) => "unstack",
            Command::StoreData(_) => "store_data",
            Command::GetData(_) => "get_data",
            Command::ReferenceData(_) => "reference_data",
            Command::DereferenceData(_) => "dereference_data",
            Command::GetStateById(_) => "get_state_by_id",
            Command::GetStateByLabels(_) => "get_state_by_labels",
            Command::GetStates(_) => "get_states",
            Command::GetDelayedStates(_) => "get_delayed_states",
            Command::Commit(_) => "commit",
        }
    }

    /// Ctx sobre el que actúa el comando, si tiene uno.
    pub fn state_ctx(&self) -> Option<&StateCtx> {
        match self {
            Command::Transit(c) => Some(&c.state_ctx),
            Command::Pause(c) => Some(&c.state_ctx),
            Command::Resume(c) => Some(&c.state_ctx),
            Command::End(c) => Some(&c.state_ctx),
            Command::CommitStateCtx(c) => Some(&c.state_ctx),
            Command::Delay(c) => Some(&c.state_ctx),
            Command::Execute(c) => Some(&c.state_ctx),
            Command::Stack(c) => Some(&c.carrier),
            Command::Unstack(c) => Some(&c.carrier),
            Command::ReferenceData(c) => Some(&c.state_ctx),
            Command::DereferenceData(c) => Some(&c.state_ctx),
            _ => None,
        }
    }

    pub fn state_ctx_mut(&mut self) -> Option<&mut StateCtx> {
        match self {
            Command::Transit(c) => Some(&mut c.state_ctx),
            Command::Pause(c) => Some(&mut c.state_ctx),
            Command::Resume(c) => Some(&mut c.state_ctx),
            Command::End(c) => Some(&mut c.state_ctx),
            Command::CommitStateCtx(c) => Some(&mut c.state_ctx),
            Command::Delay(c) => Some(&mut c.state_ctx),
            Command::Execute(c) => Some(&mut c.state_ctx),
            Command::Stack(c) => Some(&mut c.carrier),
            Command::Unstack(c) => Some(&mut c.carrier),
            Command::ReferenceData(c) => Some(&mut c.state_ctx),
            Command::DereferenceData(c) => Some(&mut c.state_ctx),
            _ => None,
        }
    }

    /// True para los comandos que, dentro de un `Commit`, producen una
    /// entrada en el log sujeta al CAS.
    pub fn is_tracked(&self) -> bool {
        matches!(self,
                 Command::Transit(_)
                 | Command::Pause(_)
                 | Command::Resume(_)
                 | Command::End(_)
                 | Command::CommitStateCtx(_))
    }

    /// Aplica la mutación local del comando sobre su ctx. Los comandos sin
    /// mutación no hacen nada.
    pub fn apply(&mut self) -> Result<()> {
        match self {
            Command::Transit(c) => c.apply(),
            Command::Pause(c) => c.apply(),
            Command::Resume(c) => c.apply(),
            Command::End(c) => c.apply(),
            Command::Stack(c) => c.apply(),
            Command::Unstack(c) => c.apply(),
            Command::ReferenceData(c) => c.apply(),
            Command::DereferenceData(c) => c.apply(),
            _ => Ok(()),
        }
    }

    /// Ctx con el que continúa el loop tras despachar este comando. Dentro de
    /// un `Commit` hay uno por id distinto; el primero es el principal.
    pub fn follow_ons(&self) -> Vec<StateCtx> {
        match self {
            Command::Transit(_) | Command::Resume(_) | Command::CommitStateCtx(_) | Command::Execute(_) => {
                self.state_ctx().cloned().into_iter().collect()
            }
            Command::Commit(c) => {
                let mut seen = HashSet::new();
                c.commands
                 .iter()
                 .filter(|sub| matches!(sub, Command::Transit(_) | Command::Resume(_) | Command::CommitStateCtx(_)))
                 .filter_map(|sub| sub.state_ctx())
                 .filter(|ctx| seen.insert(ctx.id().clone()))
                 .cloned()
                 .collect()
            }
            _ => Vec::new(),
        }
    }

    /// Extrae el ctx resultante: el propio o, para `Commit`, el del primer
    /// subcomando que tenga uno.
    pub fn into_state_ctx(self) -> Option<StateCtx> {
        match self {
            Command::Commit(c) => c.commands.into_iter().find_map(|sub| sub.into_state_ctx()),
            Command::Transit(c) => Some(c.state_ctx),
            Command::Pause(c) => Some(c.state_ctx),
            Command::Resume(c) => Some(c.state_ctx),
            Command::End(c) => Some(c.state_ctx),
            Command::CommitStateCtx(c) => Some(c.state_ctx),
            Command::Delay(c) => Some(c.state_ctx),
            Command::Execute(c) => Some(c.state_ctx),
            Command::Stack(c) => Some(c.carrier),
            Command::Unstack(c) => Some(c.carrier),
            Command::ReferenceData(c) => Some(c.state_ctx),
            Command::DereferenceData(c) => Some(c.state_ctx),
            Command::GetStateById(c) => c.result,
            Command::GetStateByLabels(c) => c.result,
            _ => None,
        }
    }
}

/// Aplica una transición de ciclo de vida: la actual pasa al historial y la
/// nueva empieza con las anotaciones del comando más la marca `mark`.
fn push_lifecycle(ctx: &mut StateCtx, to: FlowId, annotations: &Annotations, mark: Option<&str>) {
    let mut next = Transition::new(ctx.current.transition.to.clone(), to);
    next.annotations = annotations.clone();
    if let Some(mark) = mark {
        next.set_annotation(annotations::STATE, mark);
    }
    ctx.push_transition(next);
}

#[derive(Debug, Clone)]
pub struct TransitCommand {
    pub state_ctx: StateCtx,
    pub to: FlowId,
    pub annotations: Annotations,
}

impl TransitCommand {
    pub fn new(state_ctx: StateCtx, to: impl Into<FlowId>) -> Self {
        Self { state_ctx,
               to: to.into(),
               annotations: Annotations::new() }
    }

    pub fn with_annotation(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(name.into(), value.into());
        self
    }

    pub fn apply(&mut self) -> Result<()> {
        if self.to.is_empty() {
            return Err(FlowError::Validation("transit sin paso de destino".into()));
        }
        push_lifecycle(&mut self.state_ctx, self.to.clone(), &self.annotations, None);
        Ok(())
    }
}

/// Pausa: el estado queda terminal para recovery hasta un `Resume`.
#[derive(Debug, Clone)]
pub struct PauseCommand {
    pub state_ctx: StateCtx,
    pub to: Option<FlowId>,
    pub annotations: Annotations,
}

impl PauseCommand {
    pub fn new(state_ctx: StateCtx) -> Self {
        Self { state_ctx,
               to: None,
               annotations: Annotations::new() }
    }

    /// Paso en el que se reanudará (por defecto el actual).
    pub fn with_transit(mut self, to: impl Into<FlowId>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn with_annotation(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(name.into(), value.into());
        self
    }

    pub fn apply(&mut self) -> Result<()> {
        let to = self.to.clone().unwrap_or_else(|| self.state_ctx.current.transition.to.clone());
        push_lifecycle(&mut self.state_ctx, to, &self.annotations, Some(annotations::PAUSED));
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ResumeCommand {
    pub state_ctx: StateCtx,
    pub to: Option<FlowId>,
    pub annotations: Annotations,
}

impl ResumeCommand {
    pub fn new(state_ctx: StateCtx) -> Self {
        Self { state_ctx,
               to: None,
               annotations: Annotations::new() }
    }

    pub fn with_transit(mut self, to: impl Into<FlowId>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn with_annotation(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(name.into(), value.into());
        self
    }

    pub fn apply(&mut self) -> Result<()> {
        let to = self.to.clone().unwrap_or_else(|| self.state_ctx.current.transition.to.clone());
        push_lifecycle(&mut self.state_ctx, to, &self.annotations, Some(annotations::RESUMED));
        Ok(())
    }
}

/// Fin del estado: la transición nueva no tiene destino.
#[derive(Debug, Clone)]
pub struct EndCommand {
    pub state_ctx: StateCtx,
    pub annotations: Annotations,
}

impl EndCommand {
    pub fn new(state_ctx: StateCtx) -> Self {
        Self { state_ctx,
               annotations: Annotations::new() }
    }

    pub fn with_annotation(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(name.into(), value.into());
        self
    }

    pub fn apply(&mut self) -> Result<()> {
        push_lifecycle(&mut self.state_ctx, FlowId::default(), &self.annotations, Some(annotations::ENDED));
        Ok(())
    }
}

/// Persiste `current` tal cual, sin nueva transición.
#[derive(Debug, Clone)]
pub struct CommitStateCtxCommand {
    pub state_ctx: StateCtx,
}

/// Programa una re-ejecución diferida a partir de una copia del estado.
#[derive(Debug, Clone)]
pub struct DelayCommand {
    pub state_ctx: StateCtx,
    pub to: Option<FlowId>,
    pub duration: Duration,
    pub execute_at: Option<DateTime<Utc>>,
    /// Si es `false`, la copia no se commitea al disparar.
    pub commit: bool,
    pub annotations: Annotations,
    pub result: Option<DelayedState>,
}

impl DelayCommand {
    pub fn new(state_ctx: StateCtx, duration: Duration) -> Self {
        Self { state_ctx,
               to: None,
               duration,
               execute_at: None,
               commit: true,
               annotations: Annotations::new(),
               result: None }
    }

    /// Vencimiento absoluto en lugar de relativo.
    pub fn until(state_ctx: StateCtx, execute_at: DateTime<Utc>) -> Self {
        Self { execute_at: Some(execute_at),
               ..Self::new(state_ctx, Duration::ZERO) }
    }

    pub fn with_transit(mut self, to: impl Into<FlowId>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn with_commit(mut self, commit: bool) -> Self {
        self.commit = commit;
        self
    }

    pub fn with_annotation(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(name.into(), value.into());
        self
    }

    /// Construye la copia diferida de `base` y su vencimiento. La copia
    /// conserva la revisión de `base`; si estaba pausado, se marca como
    /// reanudado.
    pub fn snapshot(&self, base: &State, now: DateTime<Utc>) -> (State, DateTime<Utc>) {
        let execute_at = self.execute_at.unwrap_or_else(|| clock::shift(now, self.duration));
        let to = self.to.clone().unwrap_or_else(|| base.transition.to.clone());

        let mut next = Transition::new(base.transition.to.clone(), to);
        next.annotations = self.annotations.clone();
        next.set_annotation(annotations::DELAY_AT, annotations::format_time(execute_at));
        next.set_annotation(annotations::DELAY_DURATION, annotations::format_duration(self.duration));
        next.set_annotation(annotations::DELAY_COMMIT, self.commit.to_string());
        if base.is_paused() {
            next.set_annotation(annotations::STATE, annotations::RESUMED);
        }

        let mut snap = base.clone();
        snap.transition = next;
        (snap, execute_at)
    }
}

/// Ejecución en segundo plano de otro ctx. No permitido dentro de `Commit`.
#[derive(Debug, Clone)]
pub struct ExecuteCommand {
    pub state_ctx: StateCtx,
}

/// Apila un ctx completo dentro de una anotación del portador
/// (base64 de su JSON).
#[derive(Debug, Clone)]
pub struct StackCommand {
    pub carrier: StateCtx,
    pub stacked: StateCtx,
    pub annotation: String,
}

impl StackCommand {
    pub fn new(carrier: StateCtx, stacked: StateCtx) -> Self {
        Self { carrier,
               stacked,
               annotation: annotations::STACKED.to_string() }
    }

    pub fn with_annotation(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = annotation.into();
        self
    }

    pub fn apply(&mut self) -> Result<()> {
        if self.carrier.current.annotations.get(&self.annotation).is_some_and(|v| !v.is_empty()) {
            return Err(FlowError::Validation(format!("la anotación {} ya contiene un estado apilado",
                                                     self.annotation)));
        }
        let raw = serde_json::to_vec(&self.stacked)?;
        self.carrier.current.set_annotation(self.annotation.clone(), STANDARD.encode(raw));
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct UnstackCommand {
    pub carrier: StateCtx,
    pub annotation: String,
    pub result: Option<StateCtx>,
}

impl UnstackCommand {
    pub fn new(carrier: StateCtx) -> Self {
        Self { carrier,
               annotation: annotations::STACKED.to_string(),
               result: None }
    }

    pub fn with_annotation(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = annotation.into();
        self
    }

    pub fn apply(&mut self) -> Result<()> {
        let raw = self.carrier
                      .current
                      .annotations
                      .get(&self.annotation)
                      .filter(|v| !v.is_empty())
                      .ok_or_else(|| FlowError::NotFound(format!("no hay estado apilado en {}", self.annotation)))?;
        let bytes = STANDARD.decode(raw)
                            .map_err(|e| FlowError::Validation(format!("estado apilado corrupto: {}", e)))?;
        let stacked: StateCtx = serde_json::from_slice(&bytes)?;
        self.carrier.current.annotations.remove(&self.annotation);
        self.result = Some(stacked);
        Ok(())
    }
}

/// Guarda un blob; el almacenamiento asigna id (si falta) y revisión.
#[derive(Debug, Clone)]
pub struct StoreDataCommand {
    pub data: Data,
}

#[derive(Debug, Clone)]
pub struct GetDataCommand {
    pub data: Data,
}

/// Escribe `data:<id>:<rev>` en una anotación del estado.
#[derive(Debug, Clone)]
pub struct ReferenceDataCommand {
    pub state_ctx: StateCtx,
    pub data: Data,
    pub annotation: String,
}

impl ReferenceDataCommand {
    pub fn apply(&mut self) -> Result<()> {
        if self.data.id.is_empty() || self.data.rev <= 0 {
            return Err(FlowError::Validation("sólo se pueden referenciar datos ya guardados".into()));
        }
        self.state_ctx
            .current
            .set_annotation(self.annotation.clone(), annotations::data_ref(&self.data.id, self.data.rev));
        Ok(())
    }
}

/// Lee la referencia de una anotación. `data` queda con id y revisión; el
/// motor completa el contenido.
#[derive(Debug, Clone)]
pub struct DereferenceDataCommand {
    pub state_ctx: StateCtx,
    pub annotation: String,
    pub data: Option<Data>,
}

impl DereferenceDataCommand {
    pub fn apply(&mut self) -> Result<()> {
        let raw = self.state_ctx
                      .current
                      .annotation(&self.annotation)
                      .ok_or_else(|| FlowError::NotFound(format!("anotación {}", self.annotation)))?;
        let (id, rev) = annotations::parse_data_ref(raw)?;
        self.data = Some(Data::reference(id, rev));
        Ok(())
    }
}

/// `rev == 0` pide la última revisión.
#[derive(Debug, Clone)]
pub struct GetStateByIdCommand {
    pub id: StateId,
    pub rev: i64,
    pub result: Option<StateCtx>,
}

#[derive(Debug, Clone)]
pub struct GetStateByLabelsCommand {
    pub labels: Labels,
    pub result: Option<StateCtx>,
}

#[derive(Debug, Clone)]
pub struct GetStatesCommand {
    pub query: GetStatesQuery,
    pub result: Option<GetStatesResult>,
}

#[derive(Debug, Clone)]
pub struct GetDelayedStatesCommand {
    pub query: GetDelayedQuery,
    pub result: Option<GetDelayedResult>,
}

/// Bundle de subcomandos aplicados en orden y persistidos de forma atómica.
#[derive(Debug, Clone, Default)]
pub struct CommitCommand {
    pub commands: Vec<Command>,
}

impl CommitCommand {
    pub fn new(commands: impl IntoIterator<Item = Command>) -> Self {
        Self { commands: commands.into_iter().collect() }
    }

    /// Rechaza bundles vacíos, anidados, con `Execute` o con consultas por
    /// rango, y subcomandos sin id.
    pub fn validate(&self) -> Result<()> {
        if self.commands.is_empty() {
            return Err(FlowError::Validation("commit sin subcomandos".into()));
        }
        for sub in &self.commands {
            match sub {
                Command::Commit(_) | Command::Execute(_) | Command::GetStates(_) | Command::GetDelayedStates(_) => {
                    return Err(FlowError::Validation(format!("{} no está permitido dentro de commit", sub.name())));
                }
                _ => {}
            }
            if let Some(ctx) = sub.state_ctx() {
                if ctx.id().is_empty() {
                    return Err(FlowError::Validation(format!("{} sin id de estado", sub.name())));
                }
            }
        }
        Ok(())
    }
}

macro_rules! into_command {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Command {
                fn from(c: $ty) -> Self {
                    Command::$variant(c)
                }
            }
        )*
    };
}

into_command!(TransitCommand => Transit,
              PauseCommand => Pause,
              ResumeCommand => Resume,
              EndCommand => End,
              CommitStateCtxCommand => CommitStateCtx,
              DelayCommand => Delay,
              ExecuteCommand => Execute,
              StackCommand => Stack,
              UnstackCommand => Unstack,
              StoreDataCommand => StoreData,
              GetDataCommand => GetData,
              ReferenceDataCommand => ReferenceData,
              DereferenceDataCommand => DereferenceData,
              GetStateByIdCommand => GetStateById,
              GetStateByLabelsCommand => GetStateByLabels,
              GetStatesCommand => GetStates,
              GetDelayedStatesCommand => GetDelayedStates,
              CommitCommand => Commit);

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(id: &str, to: &str) -> StateCtx {
        State::new(id).with_transit_to(to).to_ctx()
    }

    #[test]
    fn transit_pushes_history_and_starts_clean_transition() {
        let mut base = ctx("s1", "a");
        base.current.transition.set_annotation("k", "v");
        let mut cmd = TransitCommand::new(base, "b").with_annotation("x", "1");
        cmd.apply().unwrap();

        let c = &cmd.state_ctx;
        assert_eq!(c.current.transition.from.as_str(), "a");
        assert_eq!(c.current.transition.to.as_str(), "b");
        assert_eq!(c.current.transition.annotation("k"), None);
        assert_eq!(c.current.transition.annotation("x"), Some("1"));
        assert_eq!(c.transitions.len(), 1);
        assert_eq!(c.transitions[0].annotation("k"), Some("v"));
    }

    #[test]
    fn transit_without_target_is_rejected() {
        let mut cmd = TransitCommand::new(ctx("s1", "a"), "");
        assert!(matches!(cmd.apply(), Err(FlowError::Validation(_))));
    }

    #[test]
    fn lifecycle_marks() {
        let mut pause = PauseCommand::new(ctx("s1", "a"));
        pause.apply().unwrap();
        assert!(pause.state_ctx.current.is_paused());
        assert_eq!(pause.state_ctx.current.transition.to.as_str(), "a");

        let mut resume = ResumeCommand::new(pause.state_ctx).with_transit("b");
        resume.apply().unwrap();
        assert!(resume.state_ctx.current.is_resumed());
        assert_eq!(resume.state_ctx.current.transition.to.as_str(), "b");

        let mut end = EndCommand::new(resume.state_ctx);
        end.apply().unwrap();
        assert!(end.state_ctx.current.is_ended());
        assert!(end.state_ctx.current.transition.to.is_empty());
        assert_eq!(end.state_ctx.transitions.len(), 3);
    }

    #[test]
    fn stack_then_unstack_restores_the_nested_ctx() {
        let carrier = ctx("carrier", "a");
        let nested = ctx("nested", "z").current.with_label("k", "v").to_ctx();

        let mut stack = StackCommand::new(carrier, nested.clone());
        stack.apply().unwrap();
        assert!(stack.carrier.current.annotations.contains_key(annotations::STACKED));

        let mut again = StackCommand::new(stack.carrier.clone(), nested.clone());
        assert!(again.apply().is_err());

        let mut unstack = UnstackCommand::new(stack.carrier);
        unstack.apply().unwrap();
        assert_eq!(unstack.result, Some(nested));
        assert!(!unstack.carrier.current.annotations.contains_key(annotations::STACKED));

        let mut empty = UnstackCommand::new(unstack.carrier);
        assert!(matches!(empty.apply(), Err(FlowError::NotFound(_))));
    }

    #[test]
    fn commit_bundle_validation() {
        assert!(CommitCommand::new(vec![]).validate().is_err());
        let nested = CommitCommand::new(vec![Command::commit(vec![Command::end(ctx("s1", "a"))])]);
        assert!(nested.validate().is_err());
        let exec = CommitCommand::new(vec![Command::execute(ctx("s1", "a"))]);
        assert!(exec.validate().is_err());
        let range = CommitCommand::new(vec![Command::get_states(GetStatesQuery::default())]);
        assert!(range.validate().is_err());
        let no_id = CommitCommand::new(vec![Command::end(StateCtx::default())]);
        assert!(no_id.validate().is_err());
        let ok = CommitCommand::new(vec![Command::transit(ctx("s1", "a"), "b"), Command::get_state_by_id("s2", 0)]);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn follow_ons_per_distinct_id() {
        let bundle = Command::commit(vec![Command::transit(ctx("s1", "a"), "b"),
                                          Command::commit_state_ctx(ctx("s1", "a")),
                                          Command::pause(ctx("s2", "a")),
                                          Command::resume(ctx("s3", "a"))]);
        let ids: Vec<String> = bundle.follow_ons().iter().map(|c| c.id().to_string()).collect();
        assert_eq!(ids, vec!["s1", "s3"]);
        assert!(Command::end(ctx("s1", "a")).follow_ons().is_empty());
        assert!(Command::noop().follow_ons().is_empty());
        assert_eq!(Command::transit(ctx("s1", "a"), "b").follow_ons().len(), 1);
    }

    #[test]
    fn delay_snapshot_resumes_paused_state() {
        let now = Utc::now();
        let mut pause = PauseCommand::new(ctx("s1", "a"));
        pause.apply().unwrap();
        let delay = DelayCommand::new(pause.state_ctx.clone(), Duration::from_secs(60)).with_transit("b");
        let (snap, at) = delay.snapshot(&pause.state_ctx.current, now);

        assert_eq!(at, clock::shift(now, Duration::from_secs(60)));
        assert!(snap.is_resumed());
        assert_eq!(snap.transition.to.as_str(), "b");
        assert_eq!(snap.transition.annotation(annotations::DELAY_COMMIT), Some("true"));
        assert_eq!(snap.transition.annotation(annotations::DELAY_DURATION), Some("60s"));
    }
}
