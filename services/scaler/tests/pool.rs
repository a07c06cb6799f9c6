
use fleet_scaler::collaborators::tags;
use harness::{now, World};

#[tokio::test]
async fn tops_up_missing_idle_capacity() {
    let world = World::new();
    world.machine("i-idle-1", "acme", 30).await;
    world.machine("i-idle-2", "acme", 30).await;
    world.machine("i-busy", "acme", 30).await;
    world.machine("i-booting", "acme", 1).await;
    world.runner("acme", 1, "i-idle-1", false).await;
    world.runner("acme", 2, "i-idle-2", false).await;
    world.runner("acme", 3, "i-busy", true).await;

    let balancer = world.pool(5, "acme");
    let stats = balancer.adjust_at(5, now()).await.unwrap();

    assert_eq!(stats.idle, 2);
    assert_eq!(stats.booting, 1);
    assert_eq!(stats.topped_up, 2);

    let requests = world.fleet.create_requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].target_capacity, 2);
    assert_eq!(requests[0].tag(tags::OWNER), Some("acme"));
    assert_eq!(requests[0].tag(tags::CREATED_BY), Some("pool"));
}

#[tokio::test]
async fn never_terminates_surplus() {
    let world = World::new();
    for (i, id) in ["i-1", "i-2", "i-3"].iter().enumerate() {
        world.machine(id, "acme", 30).await;
        world.runner("acme", i as u64 + 1, id, false).await;
    }

    let balancer = world.pool(1, "acme");
    let stats = balancer.adjust_at(1, now()).await.unwrap();

    assert_eq!(stats.topped_up, 0);
    assert!(world.fleet.terminated().await.is_empty());
    assert!(world.fleet.create_requests().await.is_empty());
}

#[tokio::test]
async fn other_owners_do_not_count() {
    let world = World::new();
    world.machine("i-other", "globex", 30).await;
    world.runner("globex", 1, "i-other", false).await;

    let balancer = world.pool(1, "acme");
    let stats = balancer.adjust_at(1, now()).await.unwrap();
    assert_eq!(stats.topped_up, 1);
}
