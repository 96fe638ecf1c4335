use std::path::PathBuf;
use std::sync::mpsc;

use log::{error, info};
use medley::config::CatalogConfig;
use medley::error::Result;
use medley::protocol::{ImportEvent, ImportRequest};
use medley::Catalog;

fn print_usage() {
    eprintln!(
        "usage: medley <command>\n\
         \n\
         commands:\n\
         \x20 add <folder>            add a directory and import its tracks\n\
         \x20 rescan <dir-id>         re-import an existing directory\n\
         \x20 replace <dir-id> <folder>  point a directory at a new folder and rescan\n\
         \x20 remove <dir-id>         remove a directory and all its tracks\n\
         \x20 ls                      list directories with track counts"
    );
}

fn run_import(catalog: &Catalog, request: ImportRequest) -> Result<()> {
    let (progress_tx, progress_rx) = mpsc::sync_channel(64);
    let handle = catalog.imports().start(request, progress_tx)?;

    for event in progress_rx {
        match event {
            ImportEvent::Progress(progress) => {
                let count = progress.count;
                if progress.finished {
                    info!(
                        "import finished: {} new, {} updated, {} removed",
                        count.newly_imported, count.existing_updated, count.removed
                    );
                } else {
                    info!(
                        "importing {}/{} ({} new, {} updated)",
                        count.current, count.total, count.newly_imported, count.existing_updated
                    );
                }
            }
            ImportEvent::Failed { error, .. } => {
                error!("import failed: {error}");
            }
        }
    }

    match handle.join() {
        Ok(result) => result.map(|_| ()),
        Err(_) => {
            error!("import worker panicked");
            Ok(())
        }
    }
}

fn parse_directory_id(raw: &str) -> Option<i64> {
    match raw.parse::<i64>() {
        Ok(id) if id > 0 => Some(id),
        _ => {
            eprintln!("not a directory id: {raw}");
            None
        }
    }
}

fn run(catalog: &Catalog, command: &str, args: &[String]) -> Result<bool> {
    match (command, args) {
        ("add", [folder]) => {
            let directory = catalog.service().add_directory(&PathBuf::from(folder))?;
            info!("added directory {} ({})", directory.id, folder);
            run_import(
                catalog,
                ImportRequest::DirectoryAdd {
                    directory_id: directory.id,
                    path: directory.path,
                },
            )?;
            Ok(true)
        }
        ("rescan", [raw_id]) => {
            let Some(id) = parse_directory_id(raw_id) else {
                return Ok(false);
            };
            let directory = catalog
                .service()
                .list_directories()?
                .into_iter()
                .find(|d| d.id == id);
            match directory {
                Some(directory) => {
                    run_import(
                        catalog,
                        ImportRequest::DirectoryAdd {
                            directory_id: directory.id,
                            path: directory.path,
                        },
                    )?;
                    Ok(true)
                }
                None => {
                    eprintln!("no directory with id {id}");
                    Ok(false)
                }
            }
        }
        ("replace", [raw_id, folder]) => {
            let Some(id) = parse_directory_id(raw_id) else {
                return Ok(false);
            };
            let path = PathBuf::from(folder);
            catalog.service().replace_directory(id, &path)?;
            run_import(
                catalog,
                ImportRequest::DirectoryReplace {
                    directory_id: id,
                    path,
                },
            )?;
            Ok(true)
        }
        ("remove", [raw_id]) => {
            let Some(id) = parse_directory_id(raw_id) else {
                return Ok(false);
            };
            catalog.service().remove_directory(id)?;
            info!("removed directory {id} and its tracks");
            Ok(true)
        }
        ("ls", []) => {
            let directories = catalog.service().list_directories()?;
            if directories.is_empty() {
                println!("no directories in the catalog");
                return Ok(true);
            }
            for directory in directories {
                let tracks = catalog.service().track_count_for_directory(directory.id)?;
                println!(
                    "{:>4}  {}  ({} track(s))",
                    directory.id,
                    directory.path.display(),
                    tracks
                );
            }
            Ok(true)
        }
        _ => {
            print_usage();
            Ok(false)
        }
    }
}

fn main() {
    let mut clog = colog::default_builder();
    clog.filter_level(log::LevelFilter::Info);
    clog.init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((command, rest)) = args.split_first() else {
        print_usage();
        std::process::exit(2);
    };

    let config = CatalogConfig::load_or_default();
    let catalog = match Catalog::open(&config) {
        Ok(catalog) => catalog,
        Err(err) => {
            error!("could not open the catalog: {err}");
            std::process::exit(1);
        }
    };

    let ok = match run(&catalog, command, rest) {
        Ok(ok) => ok,
        Err(err) => {
            error!("{err}");
            false
        }
    };
    catalog.shutdown();
    if !ok {
        std::process::exit(1);
    }
}
