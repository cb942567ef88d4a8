#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Chat(String),
    Start(String),
    Players,
    Ping,
    Stats,
    Quit,
    Unknown(String),
}

impl Command {
    /// Parses one line of user input. Blank lines yield nothing; anything
    /// not starting with `/` is chat.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let Some(command) = line.strip_prefix('/') else {
            return Some(Command::Chat(line.to_string()));
        };

        let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
        let rest = rest.trim();
        Some(match name {
            "quit" | "exit" => Command::Quit,
            "players" => Command::Players,
            "ping" => Command::Ping,
            "stats" => Command::Stats,
            "start" if rest.is_empty() => Command::Start("default".to_string()),
            "start" => Command::Start(rest.to_string()),
            other => Command::Unknown(other.to_string()),
        })
    }
}
