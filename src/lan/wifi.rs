//! WiFi route priority and RTL8723DS driver tuning.

use log::{debug, info, warn};
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::process::{Command, Stdio};

const ETH_IFACE: &str = "eth1";
const WLAN_IFACE: &str = "wlan0";
const FALLBACK_METRIC: &str = "100";

const AMSDU_PARAM: &str = "module/RTL8723DS/parameters/rtw_amsdu_mode";
const AMPDU_AMSDU_PARAM: &str = "module/RTL8723DS/parameters/rtw_tx_ampdu_amsdu";

/// External tools used by the WiFi helpers.
pub trait CommandRunner: Send + Sync {
    /// Stdout of the command, `None` if it could not be spawned.
    fn output(&self, program: &str, args: &[&str]) -> Option<String>;

    /// Run for its side effect. `true` on a zero exit status.
    fn run(&self, program: &str, args: &[&str]) -> bool;
}

pub struct SystemCommands;

impl CommandRunner for SystemCommands {
    fn output(&self, program: &str, args: &[&str]) -> Option<String> {
        let output = Command::new(program)
            .args(args)
            .stderr(Stdio::null())
            .output()
            .map_err(|e| debug!("{} not runnable: {}", program, e))
            .ok()?;
        Some(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn run(&self, program: &str, args: &[&str]) -> bool {
        Command::new(program)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteFix {
    Fixed,
    NothingToFix,
    /// Tools unavailable; try again later.
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverTune {
    Done,
    /// No wlan0 or not an RTL8723DS.
    Skipped,
    Retry,
}

/// First three octets of `iface`'s IPv4 address in `ifconfig` output.
pub fn iface_prefix(ifconfig: &str, iface: &str) -> Option<String> {
    let mut lines = ifconfig.lines();
    let header = lines.by_ref().find(|line| {
        line.strip_prefix(iface)
            .and_then(|rest| rest.chars().next())
            .map_or(false, |c| c == ' ' || c == '\t' || c == ':')
    })?;

    // The block is the header plus the indented lines that follow it.
    let block = std::iter::once(header).chain(lines.take_while(|l| l.starts_with([' ', '\t'])));

    for line in block {
        let addr = if let Some(pos) = line.find("inet addr:") {
            &line[pos + "inet addr:".len()..]
        } else if let Some(pos) = line.find("inet ") {
            &line[pos + "inet ".len()..]
        } else {
            continue;
        };
        let ip: Ipv4Addr = addr.split_whitespace().next()?.parse().ok()?;
        let [a, b, c, _] = ip.octets();
        return Some(format!("{}.{}.{}", a, b, c));
    }
    None
}

/// One row of `route -n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub destination: String,
    pub gateway: String,
    pub genmask: String,
    pub flags: String,
    pub metric: u32,
    pub iface: String,
}

/// Rows of `route -n` output; header lines are skipped.
pub fn parse_routes(output: &str) -> Vec<RouteEntry> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 8 {
                return None;
            }
            Some(RouteEntry {
                destination: fields[0].to_string(),
                gateway: fields[1].to_string(),
                genmask: fields[2].to_string(),
                flags: fields[3].to_string(),
                metric: fields[4].parse().ok()?,
                iface: fields[7].to_string(),
            })
        })
        .collect()
}

/// wlan0 routes to re-add with the fallback metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePlan {
    /// Shared /24 prefix, e.g. `192.168.1`.
    pub prefix: String,
    /// Gateway of wlan0's metric-0 default route, if it has one.
    pub gateway: Option<String>,
}

/// Decide whether wlan0 needs its routes demoted. `None` when eth1 and wlan0
/// are not on the same /24 or wlan0's subnet route is already demoted.
pub fn plan_route_fix(ifconfig: &str, routes: &str) -> Option<RoutePlan> {
    let eth = iface_prefix(ifconfig, ETH_IFACE)?;
    let wlan = iface_prefix(ifconfig, WLAN_IFACE)?;
    if eth != wlan {
        return None;
    }

    let subnet = format!("{}.0", wlan);
    let routes = parse_routes(routes);
    let wlan_routes = || routes.iter().filter(|r| r.iface == WLAN_IFACE && r.metric == 0);

    wlan_routes().find(|r| r.destination == subnet)?;
    let gateway = wlan_routes()
        .find(|r| r.destination == "0.0.0.0")
        .map(|r| r.gateway.clone());

    Some(RoutePlan {
        prefix: wlan,
        gateway,
    })
}

/// `route del <target>` then `route add <target> metric 100`.
fn readd_route(commands: &dyn CommandRunner, target: &[&str]) -> bool {
    let mut del = vec!["del"];
    del.extend_from_slice(target);
    // Missing route is fine.
    commands.run("route", &del);

    let mut add = vec!["add"];
    add.extend_from_slice(target);
    add.extend_from_slice(&["metric", FALLBACK_METRIC]);
    commands.run("route", &add)
}

pub(super) fn fix_route_priority(commands: &dyn CommandRunner) -> RouteFix {
    let Some(ifconfig) = commands.output("ifconfig", &[]) else {
        return RouteFix::Retry;
    };
    let Some(routes) = commands.output("route", &["-n"]) else {
        return RouteFix::Retry;
    };
    let Some(plan) = plan_route_fix(&ifconfig, &routes) else {
        return RouteFix::NothingToFix;
    };

    info!(
        "eth1 and wlan0 both on {}.0/24, preferring eth1",
        plan.prefix
    );

    let subnet = format!("{}.0", plan.prefix);
    let net = ["-net", subnet.as_str(), "netmask", "255.255.255.0", "dev", WLAN_IFACE];
    if !readd_route(commands, &net) {
        warn!("failed to re-add {} route with metric {}", subnet, FALLBACK_METRIC);
    }

    if let Some(gw) = plan.gateway.as_deref() {
        if !readd_route(commands, &["default", "gw", gw, "dev", WLAN_IFACE]) {
            warn!("failed to re-add default route via {}", gw);
        }
    }

    RouteFix::Fixed
}

fn read_param(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim_end().to_string())
}

/// Set a driver parameter to `1` if it is not already. Returns whether it
/// was written.
fn enable_param(path: &Path) -> bool {
    match read_param(path) {
        Some(value) if value != "1" => match fs::write(path, "1") {
            Ok(()) => true,
            Err(e) => {
                warn!("cannot write {}: {}", path.display(), e);
                false
            }
        },
        _ => false,
    }
}

fn power_save_on(output: &str) -> bool {
    output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .any(|(key, value)| {
            key.trim().eq_ignore_ascii_case("power save") && value.trim().eq_ignore_ascii_case("on")
        })
}

pub(super) fn optimize_driver(commands: &dyn CommandRunner, sysfs: &Path) -> DriverTune {
    let Some(wlan) = commands.output("ifconfig", &[WLAN_IFACE]) else {
        return DriverTune::Retry;
    };
    if wlan.trim().is_empty() {
        return DriverTune::Skipped;
    }

    let amsdu = sysfs.join(AMSDU_PARAM);
    if read_param(&amsdu).is_none() {
        debug!("not an RTL8723DS, leaving wifi driver alone");
        return DriverTune::Skipped;
    }

    let mut changed = enable_param(&amsdu);
    changed |= enable_param(&sysfs.join(AMPDU_AMSDU_PARAM));

    if let Some(ps) = commands.output("iw", &["dev", WLAN_IFACE, "get", "power_save"]) {
        if power_save_on(&ps) && commands.run("iw", &["dev", WLAN_IFACE, "set", "power_save", "off"]) {
            changed = true;
        }
    }

    if changed {
        info!("optimized RTL8723DS: A-MSDU enabled, power save off");
    }
    DriverTune::Done
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const IFCONFIG: &str = "\
eth1      Link encap:Ethernet  HWaddr 02:00:00:00:00:01
          inet addr:192.168.1.20  Bcast:192.168.1.255  Mask:255.255.255.0
          UP BROADCAST RUNNING MULTICAST  MTU:1500  Metric:1

lo        Link encap:Local Loopback
          inet addr:127.0.0.1  Mask:255.0.0.0

wlan0     Link encap:Ethernet  HWaddr 02:00:00:00:00:02
          inet addr:192.168.1.31  Bcast:192.168.1.255  Mask:255.255.255.0
";

    const ROUTES: &str = "\
Kernel IP routing table
Destination     Gateway         Genmask         Flags Metric Ref    Use Iface
0.0.0.0         192.168.1.1     0.0.0.0         UG    0      0        0 eth1
0.0.0.0         192.168.1.1     0.0.0.0         UG    0      0        0 wlan0
192.168.1.0     0.0.0.0         255.255.255.0   U     0      0        0 eth1
192.168.1.0     0.0.0.0         255.255.255.0   U     0      0        0 wlan0
";

    #[derive(Default)]
    struct FakeCommands {
        outputs: HashMap<String, String>,
        ran: Mutex<Vec<String>>,
    }

    impl FakeCommands {
        fn with(mut self, cmdline: &str, output: &str) -> Self {
            self.outputs.insert(cmdline.to_string(), output.to_string());
            self
        }

        fn ran(&self) -> Vec<String> {
            self.ran.lock().unwrap().clone()
        }
    }

    fn cmdline(program: &str, args: &[&str]) -> String {
        std::iter::once(program).chain(args.iter().copied()).collect::<Vec<_>>().join(" ")
    }

    impl CommandRunner for FakeCommands {
        fn output(&self, program: &str, args: &[&str]) -> Option<String> {
            self.outputs.get(&cmdline(program, args)).cloned()
        }

        fn run(&self, program: &str, args: &[&str]) -> bool {
            self.ran.lock().unwrap().push(cmdline(program, args));
            true
        }
    }

    #[test]
    fn test_iface_prefix() {
        assert_eq!(iface_prefix(IFCONFIG, "eth1").as_deref(), Some("192.168.1"));
        assert_eq!(iface_prefix(IFCONFIG, "wlan0").as_deref(), Some("192.168.1"));
        assert_eq!(iface_prefix(IFCONFIG, "lo").as_deref(), Some("127.0.0"));
        assert_eq!(iface_prefix(IFCONFIG, "eth0"), None);
        assert_eq!(iface_prefix(IFCONFIG, "wlan"), None);

        // iproute-style ifconfig.
        let modern = "wlan0: flags=4163<UP>  mtu 1500\n        inet 10.0.0.7  netmask 255.255.255.0\n";
        assert_eq!(iface_prefix(modern, "wlan0").as_deref(), Some("10.0.0"));

        // An address belonging to the next interface is not picked up.
        let bare = "eth1      Link encap:Ethernet\n          UP\nwlan0     Link\n          inet addr:10.1.1.1\n";
        assert_eq!(iface_prefix(bare, "eth1"), None);
    }

    #[test]
    fn test_parse_routes() {
        let routes = parse_routes(ROUTES);
        assert_eq!(routes.len(), 4);
        assert_eq!(routes[1].gateway, "192.168.1.1");
        assert_eq!(routes[1].iface, "wlan0");
        assert_eq!(routes[3].destination, "192.168.1.0");
        assert_eq!(routes[3].metric, 0);
    }

    #[test]
    fn test_plan_route_fix() {
        let plan = plan_route_fix(IFCONFIG, ROUTES).unwrap();
        assert_eq!(plan.prefix, "192.168.1");
        assert_eq!(plan.gateway.as_deref(), Some("192.168.1.1"));

        let demoted = ROUTES.replace("U     0      0        0 wlan0", "U     100    0        0 wlan0");
        assert_eq!(plan_route_fix(IFCONFIG, &demoted), None);

        let other_subnet = IFCONFIG.replace("inet addr:192.168.1.31", "inet addr:192.168.7.31");
        assert_eq!(plan_route_fix(&other_subnet, ROUTES), None);
    }

    #[test]
    fn test_fix_route_priority_commands() {
        let commands = FakeCommands::default()
            .with("ifconfig", IFCONFIG)
            .with("route -n", ROUTES);
        assert_eq!(fix_route_priority(&commands), RouteFix::Fixed);
        assert_eq!(
            commands.ran(),
            vec![
                "route del -net 192.168.1.0 netmask 255.255.255.0 dev wlan0",
                "route add -net 192.168.1.0 netmask 255.255.255.0 dev wlan0 metric 100",
                "route del default gw 192.168.1.1 dev wlan0",
                "route add default gw 192.168.1.1 dev wlan0 metric 100",
            ]
        );
    }

    #[test]
    fn test_fix_route_priority_without_tools() {
        assert_eq!(fix_route_priority(&FakeCommands::default()), RouteFix::Retry);

        let no_wlan = FakeCommands::default()
            .with("ifconfig", "eth1      Link\n          inet addr:192.168.1.2\n")
            .with("route -n", ROUTES);
        assert_eq!(fix_route_priority(&no_wlan), RouteFix::NothingToFix);
        assert!(no_wlan.ran().is_empty());
    }

    #[test]
    fn test_power_save_parsing() {
        assert!(power_save_on("Power save: on\n"));
        assert!(!power_save_on("Power save: off\n"));
        assert!(!power_save_on(""));
    }

    #[test]
    fn test_optimize_driver() {
        let sysfs = tempfile::tempdir().unwrap();
        let params = sysfs.path().join("module/RTL8723DS/parameters");
        fs::create_dir_all(&params).unwrap();
        fs::write(params.join("rtw_amsdu_mode"), "0\n").unwrap();
        fs::write(params.join("rtw_tx_ampdu_amsdu"), "1\n").unwrap();

        let commands = FakeCommands::default()
            .with("ifconfig wlan0", "wlan0     Link encap:Ethernet\n")
            .with("iw dev wlan0 get power_save", "Power save: on\n");
        assert_eq!(optimize_driver(&commands, sysfs.path()), DriverTune::Done);

        assert_eq!(fs::read_to_string(params.join("rtw_amsdu_mode")).unwrap(), "1");
        assert_eq!(fs::read_to_string(params.join("rtw_tx_ampdu_amsdu")).unwrap(), "1\n");
        assert_eq!(commands.ran(), vec!["iw dev wlan0 set power_save off"]);
    }

    #[test]
    fn test_optimize_driver_skips_other_hardware() {
        let sysfs = tempfile::tempdir().unwrap();
        let commands = FakeCommands::default().with("ifconfig wlan0", "wlan0     Link\n");
        assert_eq!(optimize_driver(&commands, sysfs.path()), DriverTune::Skipped);

        let no_wlan = FakeCommands::default().with("ifconfig wlan0", "");
        assert_eq!(optimize_driver(&no_wlan, sysfs.path()), DriverTune::Skipped);
        assert_eq!(optimize_driver(&FakeCommands::default(), sysfs.path()), DriverTune::Retry);
    }
}
