pub mod event;
pub mod frame;

pub use event::{KeyEvent, KeyEventType};
pub use frame::{
    BattlePhase, BattleSnapshot, BattleStats, CombatMetrics, CombatState, CombatantState,
    FrameTick,
};
