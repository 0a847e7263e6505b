//! Device action definition and command-line rendering

use std::{ fmt, path::PathBuf };
use serde::{ Serialize, Deserialize };
use crate::units::{ Ohm, Volt };

/// The part an instrument plays on the bench
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role
{
    /// Programmable resistor emulating the calibration bin
    ResistanceSetter,
    /// Supply powering the device under test
    PowerController,
    /// Oscilloscope sampling the DUT current
    Meter,
}

impl fmt::Display for Role
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(match self {
            Self::ResistanceSetter => "resistor",
            Self::PowerController => "power supply",
            Self::Meter => "meter",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action
{
    /// Program the resistor to the given value
    ///
    /// Success only means the instrument accepted the command. The value is not read back.
    SetResistance(Ohm),
    /// Switch the supply output off
    PowerOff,
    /// Switch the supply output on at the given voltage
    PowerOn(Volt),
    /// Read the mean of a scope channel
    ReadMean { channel: u8 },
    /// Enumerate attached supplies, one per stdout line
    ListSupplies,
}

/// Field-less mirror of [`Action`] for bookkeeping and lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind
{
    SetResistance,
    PowerOff,
    PowerOn,
    ReadMean,
    ListSupplies,
}

impl Action
{
    pub fn kind(&self) -> ActionKind
    {
        match self {
            Self::SetResistance(_) => ActionKind::SetResistance,
            Self::PowerOff => ActionKind::PowerOff,
            Self::PowerOn(_) => ActionKind::PowerOn,
            Self::ReadMean { .. } => ActionKind::ReadMean,
            Self::ListSupplies => ActionKind::ListSupplies,
        }
    }

    pub fn role(&self) -> Role
    {
        match self {
            Self::SetResistance(_) => Role::ResistanceSetter,
            Self::PowerOff | Self::PowerOn(_) | Self::ListSupplies => Role::PowerController,
            Self::ReadMean { .. } => Role::Meter,
        }
    }

    /// Value substituted for a template placeholder, if this action supplies one
    fn placeholder(&self, name: &str) -> Option<String>
    {
        match (self, name) {
            (Self::SetResistance(ohms), "ohms") => Some(format!("{}", ohms.display_anon())),
            (Self::PowerOn(volts), "volts") => Some(format!("{}", volts.display_anon())),
            (Self::ReadMean { channel }, "channel") => Some(channel.to_string()),
            _ => None,
        }
    }
}

impl fmt::Display for Action
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::SetResistance(ohms) => write!(f, "set {}", ohms),
            Self::PowerOff => write!(f, "off"),
            Self::PowerOn(volts) => write!(f, "on {}", volts),
            Self::ReadMean { channel } => write!(f, "read mean CH{}", channel),
            Self::ListSupplies => write!(f, "list"),
        }
    }
}

/// An external program invocation with `{placeholder}` arguments
///
/// Recognised placeholders are `{port}` and `{address}` (both the device handle's identifier),
/// `{ohms}`, `{volts}`, and `{channel}`. A placeholder the action does not supply is passed through
/// verbatim so that a misconfigured template shows up in the instrument's own error output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate
{
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory. A leading `~` is expanded from `HOME`
    #[serde(default)]
    pub cwd: Option<String>,
}

/// A fully rendered command, ready to be spawned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation
{
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl fmt::Display for Invocation
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(&self.program)?;

        for arg in self.args.iter() {
            write!(f, " {}", arg)?;
        }

        Ok(())
    }
}

impl CommandTemplate
{
    pub fn new(program: &str, args: &[&str]) -> Self
    {
        Self {
            program: program.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            cwd: None,
        }
    }

    pub fn in_dir(mut self, cwd: &str) -> Self
    {
        self.cwd = Some(cwd.to_string());
        self
    }

    pub fn render(&self, device_id: &str, action: &Action) -> Invocation
    {
        Invocation {
            program: self.program.clone(),
            args: self.args.iter().map(|arg| substitute(arg, device_id, action)).collect(),
            cwd: self.cwd.as_deref().map(expand_home),
        }
    }
}

fn substitute(arg: &str, device_id: &str, action: &Action) -> String
{
    let mut rendered = String::with_capacity(arg.len());
    let mut rest = arg;

    while let Some(open) = rest.find('{') {
        rendered.push_str(&rest[..open]);
        let tail = &rest[open..];

        match tail.find('}') {
            Some(close) => {
                let name = &tail[1..close];
                let value = match name {
                    "port" | "address" => Some(device_id.to_string()),
                    _ => action.placeholder(name),
                };

                match value {
                    Some(value) => rendered.push_str(&value),
                    None => rendered.push_str(&tail[..=close]),
                }
                rest = &tail[close + 1..];
            },
            None => {
                rendered.push_str(tail);
                rest = "";
            },
        }
    }

    rendered.push_str(rest);
    rendered
}

/// Expands a leading `~` using `HOME`. Paths are returned unchanged when `HOME` is unset
pub fn expand_home(path: &str) -> PathBuf
{
    let home = std::env::var_os("HOME");

    match (path.strip_prefix('~'), home) {
        (Some(rest), Some(home)) if rest.is_empty() || rest.starts_with('/') => {
            PathBuf::from(home).join(rest.trim_start_matches('/'))
        },
        _ => PathBuf::from(path),
    }
}

/// One command template per action, describing how this bench talks to its instruments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSet
{
    pub set_resistance: CommandTemplate,
    pub power_off: CommandTemplate,
    pub power_on: CommandTemplate,
    pub list_supplies: CommandTemplate,
    pub read_mean: CommandTemplate,
}

impl CommandSet
{
    pub fn template(&self, kind: ActionKind) -> &CommandTemplate
    {
        match kind {
            ActionKind::SetResistance => &self.set_resistance,
            ActionKind::PowerOff => &self.power_off,
            ActionKind::PowerOn => &self.power_on,
            ActionKind::ListSupplies => &self.list_supplies,
            ActionKind::ReadMean => &self.read_mean,
        }
    }

    pub fn render(&self, device_id: &str, action: &Action) -> Invocation
    {
        self.template(action.kind()).render(device_id, action)
    }
}

impl Default for CommandSet
{
    /// The uv-managed instrument scripts found on the reference bench
    fn default() -> Self
    {
        Self {
            set_resistance: CommandTemplate::new("uv", &["run", "resistance_cli.py", "-p", "{port}", "-v", "{ohms}"])
                .in_dir("~/test_script/res_ctrl"),
            power_off: CommandTemplate::new("uv", &["run", "power_ctrl_cli.py", "-a", "{address}", "-o", "off"])
                .in_dir("~/test_script/power_ctrl"),
            power_on: CommandTemplate::new("uv", &["run", "power_ctrl_cli.py", "-a", "{address}", "-v", "{volts}", "-o", "on"])
                .in_dir("~/test_script/power_ctrl"),
            list_supplies: CommandTemplate::new("uv", &["run", "power_ctrl_cli.py", "-l"])
                .in_dir("~/test_script/power_ctrl"),
            read_mean: CommandTemplate::new("uv", &["run", "yokogawa_pyvisa.py", "mean", "-c", "{channel}"])
                .in_dir("~/test_script/yokogawa"),
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::{ Action, ActionKind, CommandSet, CommandTemplate, Role };
    use crate::units::{ Ohm, Volt };

    #[test]
    fn render_set_resistance()
    {
        let cmds = CommandSet::default();
        let invocation = cmds.render("/dev/ttyUSB0", &Action::SetResistance(Ohm::from_whole(1200)));

        assert_eq!(invocation.program, "uv");
        assert_eq!(invocation.args, ["run", "resistance_cli.py", "-p", "/dev/ttyUSB0", "-v", "1200"]);
    }

    #[test]
    fn render_power_on_keeps_decimal()
    {
        let cmds = CommandSet::default();
        let invocation = cmds.render("USB0::0x2EC7::INSTR", &Action::PowerOn(Volt::from_millis(13_500)));

        assert_eq!(
            invocation.args,
            ["run", "power_ctrl_cli.py", "-a", "USB0::0x2EC7::INSTR", "-v", "13.5", "-o", "on"]
        );
    }

    #[test]
    fn render_embedded_placeholder()
    {
        let template = CommandTemplate::new("sh", &["-c", "scope --ch={channel} --dev={address}"]);
        let invocation = template.render("scope0", &Action::ReadMean { channel: 4 });

        assert_eq!(invocation.args, ["-c", "scope --ch=4 --dev=scope0"]);
    }

    #[test]
    fn unknown_placeholder_passes_through()
    {
        let template = CommandTemplate::new("tool", &["{volts}", "{nope", "x}"]);
        let invocation = template.render("dev", &Action::PowerOff);

        assert_eq!(invocation.args, ["{volts}", "{nope", "x}"]);
    }

    #[test]
    fn action_roles()
    {
        assert_eq!(Action::SetResistance(Ohm::from_whole(1)).role(), Role::ResistanceSetter);
        assert_eq!(Action::PowerOff.role(), Role::PowerController);
        assert_eq!(Action::ListSupplies.role(), Role::PowerController);
        assert_eq!(Action::ReadMean { channel: 1 }.role(), Role::Meter);
        assert_eq!(Action::PowerOn(Volt::from_whole(5)).kind(), ActionKind::PowerOn);
    }

    #[test]
    fn display_for_logs()
    {
        assert_eq!(&format!("{}", Action::SetResistance(Ohm::from_whole(95))), "set 95Ω");
        assert_eq!(&format!("{}", Action::PowerOn(Volt::from_millis(13_500))), "on 13.5V");
        assert_eq!(&format!("{}", Action::ReadMean { channel: 4 }), "read mean CH4");
    }

    #[test]
    fn partial_command_set_keeps_defaults()
    {
        let cmds: CommandSet = serde_json::from_str(r#"{ "read_mean": { "program": "sh", "args": ["-c", "echo 1"] } }"#).unwrap();

        assert_eq!(cmds.read_mean.program, "sh");
        assert_eq!(cmds.read_mean.cwd, None);
        assert_eq!(cmds.set_resistance, CommandSet::default().set_resistance);
    }
}
