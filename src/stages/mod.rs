pub mod interpreter;
pub mod narrator;
pub mod planner;

pub use interpreter::{InterpreterOutput, ProposedAction, RiskFlag, run_interpreter};
pub use narrator::{
    EstablishedFact, IntroducedEntity, NarratorOutput, NarratorThreadUpdate, SceneTransition,
    run_narrator, run_recap,
};
pub use planner::{PlannerOutput, TensionMove, run_planner};
