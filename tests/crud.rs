use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use cap_remoting::{
    bean::{
        register_crud_methods, Bean, BeanDto, BeanProvider, HashMapCrudRepository, RemoteCrudClient,
        SortKey,
    },
    error::{CrudError, InvocationError},
    invocation::{
        InvocationClientService, InvocationClientServiceRegistry, InvocationServerMessageReceiver,
        InvocationServerServiceRegistry,
    },
    message::InvocationMessage,
    transport::actor::ActorBroker,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct Job {
    title: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct Person {
    id: u64,
    name: String,
    age: Option<u32>,
    jobs: Vec<Job>,
}

impl Bean for Person {
    type Id = u64;

    fn id(&self) -> u64 {
        self.id
    }
}

fn person(id: u64, name: &str, age: Option<u32>, jobs: &[&str]) -> Person {
    Person {
        id,
        name: name.to_string(),
        age,
        jobs: jobs
            .iter()
            .map(|title| Job {
                title: title.to_string(),
            })
            .collect(),
    }
}

fn people() -> Result<Arc<HashMapCrudRepository<Person>>, CrudError> {
    let next_id = AtomicU64::new(100);
    let repository = Arc::new(HashMapCrudRepository::new(move || Person {
        id: next_id.fetch_add(1, Ordering::Relaxed),
        ..Person::default()
    }));
    repository.post_create(person(1, "Harald", Some(52), &["Developer", "Architect"]))?;
    repository.post_create(person(2, "Anna", Some(31), &["Tester"]))?;
    repository.post_create(person(3, "Bert", None, &[]))?;
    Ok(repository)
}

#[test]
fn provider_reads_bean_by_key() -> Result<(), CrudError> {
    let provider = BeanProvider::new(people()?);

    let dtos = provider.read(&[1])?;
    assert_eq!(dtos.len(), 1);
    assert_eq!(dtos[0].id, json!(1));
    assert_eq!(dtos[0].value("name"), Some(&json!("Harald")));
    let jobs = dtos[0].value("jobs").and_then(|jobs| jobs.as_array());
    assert_eq!(jobs.map(Vec::len), Some(2));
    Ok(())
}

#[test]
fn provider_returns_empty_list_for_missing_key() -> Result<(), CrudError> {
    let provider = BeanProvider::new(people()?);
    assert!(provider.read(&[42])?.is_empty());
    Ok(())
}

#[test]
fn provider_sorts_with_nulls_last() -> Result<(), CrudError> {
    let provider = BeanProvider::new(people()?);

    let names = |dtos: Vec<BeanDto>| -> Vec<String> {
        dtos.iter()
            .filter_map(|dto| dto.value("name").and_then(|name| name.as_str()).map(str::to_string))
            .collect()
    };
    assert_eq!(names(provider.read_all(&[SortKey::ascending("age")])?), ["Anna", "Harald", "Bert"]);
    assert_eq!(names(provider.read_all(&[SortKey::descending("age")])?), ["Harald", "Anna", "Bert"]);
    Ok(())
}

#[test]
fn repository_lifecycle() -> Result<(), CrudError> {
    let repository = people()?;

    let mut created = repository.create();
    created.name = "Carla".to_string();
    assert_eq!(repository.find(&created.id), None);
    repository.post_create(created.clone())?;
    assert_eq!(repository.find(&created.id), Some(created.clone()));

    repository.delete(&created.id)?;
    assert_eq!(repository.find(&created.id), None);
    Ok(())
}

struct RemotePeople {
    client: RemoteCrudClient<Person>,
    repository: Arc<HashMapCrudRepository<Person>>,
    server: ActorBroker<InvocationMessage>,
    caller: ActorBroker<InvocationMessage>,
}

impl RemotePeople {
    fn start() -> Result<Self, CrudError> {
        let repository = people()?;
        let services = Arc::new(InvocationServerServiceRegistry::new());
        register_crud_methods(&services, "person", BeanProvider::new(repository.clone()));

        let registry = Arc::new(InvocationClientServiceRegistry::new());
        let server =
            ActorBroker::<InvocationMessage>::spawn(Arc::new(InvocationServerMessageReceiver::new(services)));
        let caller = ActorBroker::<InvocationMessage>::spawn(registry.clone());
        let service = InvocationClientService::new(server.channel_from(&caller), registry);

        Ok(RemotePeople {
            client: RemoteCrudClient::new(service, "person"),
            repository,
            server,
            caller,
        })
    }

    async fn stop(self) {
        self.server.stop().await;
        self.caller.stop().await;
    }
}

#[tokio::test]
async fn remote_crud_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let remote = RemotePeople::start()?;

    let harald = remote.client.read(&[1]).await?;
    assert_eq!(harald.len(), 1);
    assert_eq!(harald[0].value("name"), Some(&json!("Harald")));
    assert!(remote.client.read(&[42]).await?.is_empty());

    let created = remote
        .client
        .create(&BeanDto::default().with_value("name", json!("Carla")))
        .await?;
    assert_eq!(created.name, "Carla");
    assert_eq!(remote.repository.find(&created.id), Some(created.clone()));

    let renamed = remote
        .client
        .update(&Person {
            name: "Carla Maria".to_string(),
            ..created.clone()
        })
        .await?;
    assert_eq!(remote.repository.find(&created.id), Some(renamed));

    remote.client.delete(&created.id).await?;
    assert_eq!(remote.repository.find(&created.id), None);

    remote.stop().await;
    Ok(())
}

#[tokio::test]
async fn remote_delete_of_missing_bean_fails() -> Result<(), Box<dyn std::error::Error>> {
    let remote = RemotePeople::start()?;

    let err = remote.client.delete(&42).await.unwrap_err();
    assert!(matches!(err, InvocationError::Remote(_)));

    remote.stop().await;
    Ok(())
}
