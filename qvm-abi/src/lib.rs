//! Shared numbering between hosts and guest modules: module kinds, their
//! exported entry commands, and the trap ids every host table understands.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryCommand {
    pub value: i32,
    pub name: &'static str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AbiTrap {
    pub id: u32,
    pub name: &'static str,
    pub arity: u8,
}

pub const GAME_API_VERSION: i32 = 8;
pub const CGAME_IMPORT_API_VERSION: i32 = 4;
pub const UI_API_VERSION: i32 = 6;

pub const GAME_INIT: i32 = 0;
pub const GAME_SHUTDOWN: i32 = 1;
pub const GAME_CLIENT_CONNECT: i32 = 2;
pub const GAME_CLIENT_BEGIN: i32 = 3;
pub const GAME_CLIENT_USERINFO_CHANGED: i32 = 4;
pub const GAME_CLIENT_DISCONNECT: i32 = 5;
pub const GAME_CLIENT_COMMAND: i32 = 6;
pub const GAME_CLIENT_THINK: i32 = 7;
pub const GAME_RUN_FRAME: i32 = 8;
pub const GAME_CONSOLE_COMMAND: i32 = 9;
pub const BOTAI_START_FRAME: i32 = 10;

pub const CG_INIT: i32 = 0;
pub const CG_SHUTDOWN: i32 = 1;
pub const CG_CONSOLE_COMMAND: i32 = 2;
pub const CG_DRAW_ACTIVE_FRAME: i32 = 3;
pub const CG_CROSSHAIR_PLAYER: i32 = 4;
pub const CG_LAST_ATTACKER: i32 = 5;
pub const CG_KEY_EVENT: i32 = 6;
pub const CG_MOUSE_EVENT: i32 = 7;
pub const CG_EVENT_HANDLING: i32 = 8;

pub const UI_GETAPIVERSION: i32 = 0;
pub const UI_INIT: i32 = 1;
pub const UI_SHUTDOWN: i32 = 2;
pub const UI_KEY_EVENT: i32 = 3;
pub const UI_MOUSE_EVENT: i32 = 4;
pub const UI_REFRESH: i32 = 5;
pub const UI_IS_FULLSCREEN: i32 = 6;
pub const UI_SET_ACTIVE_MENU: i32 = 7;
pub const UI_CONSOLE_COMMAND: i32 = 8;
pub const UI_DRAW_CONNECT_SCREEN: i32 = 9;
pub const UI_HASUNIQUECDKEY: i32 = 10;

pub const GAME_COMMANDS: [EntryCommand; 11] = [
    EntryCommand {
        value: GAME_INIT,
        name: "init",
    },
    EntryCommand {
        value: GAME_SHUTDOWN,
        name: "shutdown",
    },
    EntryCommand {
        value: GAME_CLIENT_CONNECT,
        name: "client_connect",
    },
    EntryCommand {
        value: GAME_CLIENT_BEGIN,
        name: "client_begin",
    },
    EntryCommand {
        value: GAME_CLIENT_USERINFO_CHANGED,
        name: "client_userinfo_changed",
    },
    EntryCommand {
        value: GAME_CLIENT_DISCONNECT,
        name: "client_disconnect",
    },
    EntryCommand {
        value: GAME_CLIENT_COMMAND,
        name: "client_command",
    },
    EntryCommand {
        value: GAME_CLIENT_THINK,
        name: "client_think",
    },
    EntryCommand {
        value: GAME_RUN_FRAME,
        name: "run_frame",
    },
    EntryCommand {
        value: GAME_CONSOLE_COMMAND,
        name: "console_command",
    },
    EntryCommand {
        value: BOTAI_START_FRAME,
        name: "botai_start_frame",
    },
];

pub const CGAME_COMMANDS: [EntryCommand; 9] = [
    EntryCommand {
        value: CG_INIT,
        name: "init",
    },
    EntryCommand {
        value: CG_SHUTDOWN,
        name: "shutdown",
    },
    EntryCommand {
        value: CG_CONSOLE_COMMAND,
        name: "console_command",
    },
    EntryCommand {
        value: CG_DRAW_ACTIVE_FRAME,
        name: "draw_active_frame",
    },
    EntryCommand {
        value: CG_CROSSHAIR_PLAYER,
        name: "crosshair_player",
    },
    EntryCommand {
        value: CG_LAST_ATTACKER,
        name: "last_attacker",
    },
    EntryCommand {
        value: CG_KEY_EVENT,
        name: "key_event",
    },
    EntryCommand {
        value: CG_MOUSE_EVENT,
        name: "mouse_event",
    },
    EntryCommand {
        value: CG_EVENT_HANDLING,
        name: "event_handling",
    },
];

pub const UI_COMMANDS: [EntryCommand; 11] = [
    EntryCommand {
        value: UI_GETAPIVERSION,
        name: "get_api_version",
    },
    EntryCommand {
        value: UI_INIT,
        name: "init",
    },
    EntryCommand {
        value: UI_SHUTDOWN,
        name: "shutdown",
    },
    EntryCommand {
        value: UI_KEY_EVENT,
        name: "key_event",
    },
    EntryCommand {
        value: UI_MOUSE_EVENT,
        name: "mouse_event",
    },
    EntryCommand {
        value: UI_REFRESH,
        name: "refresh",
    },
    EntryCommand {
        value: UI_IS_FULLSCREEN,
        name: "is_fullscreen",
    },
    EntryCommand {
        value: UI_SET_ACTIVE_MENU,
        name: "set_active_menu",
    },
    EntryCommand {
        value: UI_CONSOLE_COMMAND,
        name: "console_command",
    },
    EntryCommand {
        value: UI_DRAW_CONNECT_SCREEN,
        name: "draw_connect_screen",
    },
    EntryCommand {
        value: UI_HASUNIQUECDKEY,
        name: "has_unique_cdkey",
    },
];

/// Which engine subsystem a module is loaded for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    Game,
    ClientGame,
    Ui,
}

impl ModuleKind {
    pub fn name(self) -> &'static str {
        match self {
            ModuleKind::Game => "game",
            ModuleKind::ClientGame => "cgame",
            ModuleKind::Ui => "ui",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "game" | "qagame" => Some(ModuleKind::Game),
            "cgame" => Some(ModuleKind::ClientGame),
            "ui" | "q3_ui" => Some(ModuleKind::Ui),
            _ => None,
        }
    }

    pub fn api_version(self) -> i32 {
        match self {
            ModuleKind::Game => GAME_API_VERSION,
            ModuleKind::ClientGame => CGAME_IMPORT_API_VERSION,
            ModuleKind::Ui => UI_API_VERSION,
        }
    }

    pub fn commands(self) -> &'static [EntryCommand] {
        match self {
            ModuleKind::Game => &GAME_COMMANDS,
            ModuleKind::ClientGame => &CGAME_COMMANDS,
            ModuleKind::Ui => &UI_COMMANDS,
        }
    }

    pub fn command(self, name: &str) -> Option<EntryCommand> {
        self.commands()
            .iter()
            .copied()
            .find(|command| command.name == name)
    }

    pub fn init_command(self) -> i32 {
        match self {
            ModuleKind::Game => GAME_INIT,
            ModuleKind::ClientGame => CG_INIT,
            ModuleKind::Ui => UI_INIT,
        }
    }

    pub fn frame_command(self) -> i32 {
        match self {
            ModuleKind::Game => GAME_RUN_FRAME,
            ModuleKind::ClientGame => CG_DRAW_ACTIVE_FRAME,
            ModuleKind::Ui => UI_REFRESH,
        }
    }

    pub fn shutdown_command(self) -> i32 {
        match self {
            ModuleKind::Game => GAME_SHUTDOWN,
            ModuleKind::ClientGame => CG_SHUTDOWN,
            ModuleKind::Ui => UI_SHUTDOWN,
        }
    }

    /// Console traps sit at the start of every import table, but the ui
    /// table swaps print and error.
    pub fn print_trap(self) -> u32 {
        match self {
            ModuleKind::Game | ModuleKind::ClientGame => 0,
            ModuleKind::Ui => 1,
        }
    }

    pub fn error_trap(self) -> u32 {
        match self {
            ModuleKind::Game | ModuleKind::ClientGame => 1,
            ModuleKind::Ui => 0,
        }
    }

    pub fn milliseconds_trap(self) -> u32 {
        2
    }
}

pub const TRAP_MEMSET: u32 = 100;
pub const TRAP_MEMCPY: u32 = 101;
pub const TRAP_STRNCPY: u32 = 102;
pub const TRAP_SIN: u32 = 103;
pub const TRAP_COS: u32 = 104;
pub const TRAP_ATAN2: u32 = 105;
pub const TRAP_SQRT: u32 = 106;
pub const TRAP_MATRIXMULTIPLY: u32 = 107;
pub const TRAP_ANGLEVECTORS: u32 = 108;
pub const TRAP_PERPENDICULARVECTOR: u32 = 109;
pub const TRAP_FLOOR: u32 = 110;
pub const TRAP_CEIL: u32 = 111;
pub const TRAP_TESTPRINTINT: u32 = 112;
pub const TRAP_TESTPRINTFLOAT: u32 = 113;

pub const SHARED_TRAPS: [AbiTrap; 14] = [
    AbiTrap {
        id: TRAP_MEMSET,
        name: "memset",
        arity: 3,
    },
    AbiTrap {
        id: TRAP_MEMCPY,
        name: "memcpy",
        arity: 3,
    },
    AbiTrap {
        id: TRAP_STRNCPY,
        name: "strncpy",
        arity: 3,
    },
    AbiTrap {
        id: TRAP_SIN,
        name: "sin",
        arity: 1,
    },
    AbiTrap {
        id: TRAP_COS,
        name: "cos",
        arity: 1,
    },
    AbiTrap {
        id: TRAP_ATAN2,
        name: "atan2",
        arity: 2,
    },
    AbiTrap {
        id: TRAP_SQRT,
        name: "sqrt",
        arity: 1,
    },
    AbiTrap {
        id: TRAP_MATRIXMULTIPLY,
        name: "matrix_multiply",
        arity: 3,
    },
    AbiTrap {
        id: TRAP_ANGLEVECTORS,
        name: "angle_vectors",
        arity: 4,
    },
    AbiTrap {
        id: TRAP_PERPENDICULARVECTOR,
        name: "perpendicular_vector",
        arity: 2,
    },
    AbiTrap {
        id: TRAP_FLOOR,
        name: "floor",
        arity: 1,
    },
    AbiTrap {
        id: TRAP_CEIL,
        name: "ceil",
        arity: 1,
    },
    AbiTrap {
        id: TRAP_TESTPRINTINT,
        name: "test_print_int",
        arity: 2,
    },
    AbiTrap {
        id: TRAP_TESTPRINTFLOAT,
        name: "test_print_float",
        arity: 2,
    },
];

pub fn shared_trap(id: u32) -> Option<AbiTrap> {
    SHARED_TRAPS.iter().copied().find(|trap| trap.id == id)
}

/// Guest-side call target for a trap id, as pushed before `CALL`.
pub fn trap_call_target(id: u32) -> i32 {
    -1 - id as i32
}
