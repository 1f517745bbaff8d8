//! Serialization of StepRuns into instrument method calls.

use chrono::{DateTime, Utc};
use pal_core::{Job, PositionSnapshot, StepRun};
use transport::{JobCommand, MethodCall};
use uuid::Uuid;

use crate::config::join_instrument_path;

/// Name of the aux log the instrument appends to for one job.
pub fn aux_log_name(job_id: Uuid, submitted_at: DateTime<Utc>) -> String {
    let id = job_id.simple().to_string();
    format!("{}_{}.txt", submitted_at.format("%Y%m%d-%H%M%S"), &id[..8])
}

/// Full instrument-side path of a run's method file.
pub fn method_path(method_dir: &str, run: &StepRun) -> String {
    join_instrument_path(method_dir, run.method.method_file())
}

fn endpoint(snapshot: Option<&PositionSnapshot>) -> [String; 4] {
    match snapshot {
        None => Default::default(),
        Some(snapshot) => {
            let name = snapshot.position.name().to_string();
            match snapshot.position.coord() {
                Some(coord) => [
                    name,
                    coord.tray.to_string(),
                    coord.slot.to_string(),
                    coord.vial.to_string(),
                ],
                None => [name, String::new(), String::new(), String::new()],
            }
        }
    }
}

/// Fixed-order parameter tuple for one run:
/// `tool;volume_ul;source;tray;slot;vial;dest;tray;slot;vial;wash1..4;logfile`.
pub fn step_params(run: &StepRun, logfile: &str) -> String {
    let mut fields = Vec::with_capacity(15);
    fields.push(run.tool.as_str().to_string());
    fields.push(format!("{}", run.volume_ul));
    fields.extend(endpoint(run.source.as_ref()));
    fields.extend(endpoint(run.destination.as_ref()));
    fields.extend(
        run.wash
            .as_array()
            .iter()
            .map(|flag| if *flag { "1" } else { "0" }.to_string()),
    );
    fields.push(logfile.to_string());
    fields.join(";")
}

/// One method call per run, in run order.
pub fn job_command(job: &Job, method_dir: &str, logfile: &str) -> JobCommand {
    JobCommand::new(
        job.runs
            .iter()
            .map(|run| MethodCall::new(method_path(method_dir, run), step_params(run, logfile)))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pal_core::{
        ArchiveParams, CustomCapabilities, CustomPosition, Method, Position, PositionRequest, Tool,
        TrayCoord, TrayKind, WashFlags,
    };

    fn archive_run() -> StepRun {
        let mut run = StepRun::new(
            0,
            0,
            Method::Archive(ArchiveParams {
                source: PositionRequest::custom("cell1_we"),
                volume_ul: 200.0,
            }),
            Tool::Ls3,
            WashFlags {
                wash1: true,
                ..WashFlags::default()
            },
        );
        run.source = Some(PositionSnapshot::new(
            Position::Custom(CustomPosition::new("cell1_we", CustomCapabilities::default())),
            None,
        ));
        run.destination = Some(PositionSnapshot::new(
            Position::Tray {
                coord: TrayCoord::new(2, 1, 4),
                tray_kind: TrayKind::Vt54,
            },
            None,
        ));
        run
    }

    #[test]
    fn test_step_params_layout() {
        let params = step_params(&archive_run(), "C:/logs/aux.txt");
        assert_eq!(params, "LS3;200;cell1_we;;;;tray;2;1;4;1;0;0;0;C:/logs/aux.txt");
        assert_eq!(params.split(';').count(), 15);
    }

    #[test]
    fn test_deep_clean_params() {
        let run = StepRun::new(0, 0, Method::DeepClean, Tool::Ls1, WashFlags::all());
        assert_eq!(step_params(&run, "aux.txt"), "LS1;0;;;;;;;;;1;1;1;1;aux.txt");
    }

    #[test]
    fn test_fractional_volume() {
        let mut run = archive_run();
        run.volume_ul = 12.5;
        assert!(step_params(&run, "aux.txt").starts_with("LS3;12.5;"));
    }

    #[test]
    fn test_job_command_order() {
        let job = Job::new(vec![
            archive_run(),
            StepRun::new(1, 0, Method::DeepClean, Tool::Ls3, WashFlags::all()),
        ]);
        let command = job_command(&job, "C:/methods", "C:/logs/aux.txt");
        assert_eq!(command.calls.len(), 2);
        assert_eq!(command.calls[0].method_file, "C:/methods/lcfc_archive.cam");
        assert_eq!(command.calls[1].method_file, "C:/methods/lcfc_deep_clean.cam");
    }

    #[test]
    fn test_aux_log_name() {
        let id = Uuid::parse_str("0123456789abcdef0123456789abcdef").unwrap();
        let at = DateTime::parse_from_rfc3339("2024-03-05T07:08:09Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(aux_log_name(id, at), "20240305-070809_01234567.txt");
    }
}
