use anyhow::{bail, Context, Result};

use cgroups::{fs::KernelFs, FileInfo, HierarchyRegistry, Manager, WalkOrder};

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (controller, group) = match args.as_slice() {
        [] => {
            let registry = HierarchyRegistry::initialize()?;
            for info in registry.list_controllers() {
                println!("{}", serde_json::to_string(&info)?);
            }
            return Ok(());
        }
        [controller] => (controller.as_str(), "/"),
        [controller, group] => (controller.as_str(), group.as_str()),
        _ => bail!("usage: tree [CONTROLLER [GROUP]]"),
    };

    let fs = KernelFs;
    let registry = HierarchyRegistry::initialize_with(&fs)?;
    let manager = Manager::new(&registry, &fs);
    let walk = manager
        .walk_tree(controller, group, 0, WalkOrder::PreOrder)
        .with_context(|| format!("failed to walk {group} of {controller}"))?;
    for entry in walk {
        let entry: FileInfo = entry?;
        println!("{}", serde_json::to_string(&entry)?);
    }
    Ok(())
}
