//! Service Discovery (C8, spec §4.8): groups running containers into
//! services by a fixed label/name priority, deterministic given the same
//! (container-set, stacks) input.

use crate::runtime::Container;
use std::collections::HashMap;

/// A named group of containers, not yet resolved against config (spec §3).
#[derive(Debug, Clone)]
pub struct Service {
    pub name: String,
    pub containers: Vec<Container>,
}

/// The service name for one container: first match of compose-project
/// label, portainer-stack label, longest stack-name prefix of the
/// container name, or the container name itself (spec §4.8).
pub fn service_name_for(container: &Container, known_stacks: &[String]) -> String {
    if let Some(name) = container.labels.get("com.docker.compose.project") {
        return name.clone();
    }
    if let Some(name) = container.labels.get("io.docker.compose.project") {
        return name.clone();
    }
    if let Some(name) = container.labels.get("io.portainer.stackname") {
        return name.clone();
    }
    if let Some(stack) = longest_prefix_match(&container.name, known_stacks) {
        return stack;
    }
    container.name.clone()
}

fn longest_prefix_match(container_name: &str, known_stacks: &[String]) -> Option<String> {
    known_stacks
        .iter()
        .filter(|stack| container_name.starts_with(format!("{stack}_").as_str()))
        .max_by_key(|stack| stack.len())
        .cloned()
}

/// Groups `containers` into services, preserving each container's input
/// order within its group (spec §4.8 determinism law).
pub fn discover_services(containers: Vec<Container>, known_stacks: &[String]) -> Vec<Service> {
    let mut order: Vec<String> = Vec::new();
    let mut grouped: HashMap<String, Vec<Container>> = HashMap::new();

    for container in containers {
        let name = service_name_for(&container, known_stacks);
        if !grouped.contains_key(&name) {
            order.push(name.clone());
        }
        grouped.entry(name).or_default().push(container);
    }

    order
        .into_iter()
        .map(|name| {
            let containers = grouped.remove(&name).unwrap_or_default();
            Service { name, containers }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ContainerStatus;
    use std::collections::HashMap as Map;

    fn container(name: &str, labels: &[(&str, &str)]) -> Container {
        Container {
            id: name.to_string(),
            name: name.to_string(),
            image_reference: "test:latest".to_string(),
            status: ContainerStatus::Running,
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<Map<_, _>>(),
            env: vec![],
            mounts: vec![],
        }
    }

    #[test]
    fn compose_label_wins_over_name_prefix() {
        let c = container("acme_web_1", &[("com.docker.compose.project", "acme")]);
        assert_eq!(service_name_for(&c, &["other".to_string()]), "acme");
    }

    #[test]
    fn falls_back_to_longest_stack_prefix() {
        let c = container("acme_web_1", &[]);
        let stacks = vec!["acme".to_string(), "acme_web".to_string()];
        assert_eq!(service_name_for(&c, &stacks), "acme_web");
    }

    #[test]
    fn falls_back_to_container_name_with_no_other_signal() {
        let c = container("standalone", &[]);
        assert_eq!(service_name_for(&c, &[]), "standalone");
    }

    #[test]
    fn discovery_is_deterministic_given_the_same_input() {
        let containers = vec![container("acme_db_1", &[]), container("acme_web_1", &[])];
        let stacks = vec!["acme".to_string()];
        let first = discover_services(containers.clone(), &stacks);
        let second = discover_services(containers, &stacks);
        let first_names: Vec<_> = first.iter().map(|s| s.name.clone()).collect();
        let second_names: Vec<_> = second.iter().map(|s| s.name.clone()).collect();
        assert_eq!(first_names, second_names);
        assert_eq!(first[0].containers.len(), 2);
    }
}
