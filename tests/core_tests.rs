mod common;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{init_logging, Collector};
use logstream::{Backlog, Category, CategoryFlags, Config, Core, EventLoop, Level, Receiver, Sender};
use parking_lot::Mutex;

fn setup(config: Config) -> (EventLoop, Core) {
    init_logging();
    let event_loop = EventLoop::new().unwrap();
    let core = Core::new(&event_loop, &config);
    (event_loop, core)
}

fn subscribe(core: &Core, name: &str) -> (Arc<Sender>, Arc<Receiver>, Collector) {
    let sender = core.new_sender(name).unwrap();
    let receiver = Receiver::new(core.event_loop(), sender.take_peer().unwrap()).unwrap();
    let collector = Collector::attach(&receiver);
    (sender, receiver, collector)
}

fn names(categories: &[Arc<Category>]) -> Vec<String> {
    categories.iter().map(|c| c.name().to_string()).collect()
}

#[test]
fn test_nothing_sent_without_senders() {
    let (_event_loop, core) = setup(Config::default());
    core.new_category("net", Level::Undefined, CategoryFlags::ENABLED);
    assert!(!core.should_log(Level::Always, None).0);
    assert!(!core.log(Level::Always, Some("net"), "nobody listens"));
}

#[test]
fn test_filter_matrix() {
    let (_event_loop, core) = setup(Config::default());
    let verbose = core.new_category("Verbose", Level::Verbose, CategoryFlags::ENABLED);
    core.new_category("Disabled", Level::Undefined, CategoryFlags::NONE);
    core.new_category("Plain", Level::Undefined, CategoryFlags::ENABLED);
    let (_sender, _receiver, _collector) = subscribe(&core, "viewer");

    let (send, category) = core.should_log(Level::Verbose, Some("Verbose"));
    assert!(send);
    assert_eq!(category.map(|c| c.id()), Some(verbose.id()));

    assert!(!core.should_log(Level::Info, Some("Disabled")).0);
    assert!(!core.should_log(Level::Always, Some("Disabled")).0);
    assert!(core.should_log(Level::Info, None).0);
    assert!(!core.should_log(Level::Debug, None).0);

    // An enabled category without a level follows the default
    assert!(core.should_log(Level::Info, Some("Plain")).0);
    assert!(!core.should_log(Level::Debug, Some("Plain")).0);

    // Unknown names behave like no category
    let (send, category) = core.should_log(Level::Info, Some("Unknown"));
    assert!(send);
    assert!(category.is_none());
    assert!(!core.should_log(Level::Debug, Some("Unknown")).0);
    assert!(core.find_category("Unknown").is_none());
}

#[test]
fn test_category_level_overrides_default() {
    let (_event_loop, core) = setup(Config::default().default_level(Level::Verbose));
    core.new_category("quiet", Level::Error, CategoryFlags::ENABLED);
    let (_sender, _receiver, _collector) = subscribe(&core, "viewer");

    assert!(core.should_log(Level::Verbose, None).0);
    assert!(!core.should_log(Level::Warning, Some("quiet")).0);
    assert!(core.should_log(Level::Critical, Some("quiet")).0);
}

#[test]
fn test_log_delivers_stamped_message() {
    let (event_loop, core) = setup(Config::default());
    let net = core.new_category("net", Level::Undefined, CategoryFlags::ENABLED);
    let (_sender, _receiver, collector) = subscribe(&core, "viewer");

    assert!(core.log(Level::Warning, Some("net"), "link down"));
    assert!(core.log(Level::Info, None, "no category"));
    assert!(!core.log(Level::Debug, None, "filtered"));
    assert!(collector.wait_messages(&event_loop, 2));

    let messages = collector.messages();
    assert_eq!(messages[0].text(), "link down");
    assert_eq!(messages[0].category(), net.id());
    assert_eq!(messages[0].level(), Level::Warning);
    assert_eq!(messages[0].index(), 0);
    assert!(messages[0].timestamp() > 0);
    assert_eq!(messages[1].category(), 0);
    assert_eq!(messages[1].index(), 1);
    assert!(messages[1].timestamp() >= messages[0].timestamp());
}

#[test]
fn test_subscribers_share_stamp() {
    let (event_loop, core) = setup(Config::default());
    let (_a, _ra, first) = subscribe(&core, "a");
    let (_b, _rb, second) = subscribe(&core, "b");
    assert_eq!(core.sender_count(), 2);

    for i in 0..5 {
        core.log(Level::Info, None, &format!("line {}", i));
    }
    assert!(first.wait_messages(&event_loop, 5));
    assert!(second.wait_messages(&event_loop, 5));
    assert_eq!(first.messages(), second.messages());
}

#[test]
fn test_late_subscriber_sees_later_indices() {
    let (event_loop, core) = setup(Config::default());
    let (_a, _ra, first) = subscribe(&core, "a");
    core.log(Level::Info, None, "before");
    let (_b, _rb, second) = subscribe(&core, "b");
    core.log(Level::Info, None, "after");

    assert!(first.wait_messages(&event_loop, 2));
    assert!(second.wait_messages(&event_loop, 1));
    assert_eq!(first.indices(), vec![0, 1]);
    assert_eq!(second.indices(), vec![1]);
    assert_eq!(second.skipped(), 0);
}

#[test]
fn test_idempotent_registration() {
    let (_event_loop, core) = setup(Config::default());
    let added = Arc::new(AtomicUsize::new(0));
    let counter = added.clone();
    core.add_category_added_handler(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let first = core.new_category("X", Level::Info, CategoryFlags::ENABLED);
    let second = core.new_category("X", Level::Debug, CategoryFlags::NONE);
    assert_eq!(first.id(), second.id());
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.level(), Level::Info);
    assert!(second.is_enabled());
    assert_eq!(added.load(Ordering::SeqCst), 1);
}

#[test]
fn test_category_ids_and_default_flags() {
    let (_event_loop, core) = setup(Config::default());
    let a = core.new_category("a", Level::Undefined, CategoryFlags::ENABLED);
    let b = core.new_category("b", Level::Undefined, CategoryFlags::ENABLED_BY_DEFAULT);
    let c = core.new_category("c", Level::Undefined, CategoryFlags::HIDE_NAME);
    assert_eq!((a.id(), b.id(), c.id()), (1, 2, 3));

    assert!(a.flags().contains(CategoryFlags::ENABLED | CategoryFlags::ENABLED_BY_DEFAULT));
    assert_eq!(b.flags(), CategoryFlags::ENABLED_BY_DEFAULT);
    assert_eq!(c.flags(), CategoryFlags::HIDE_NAME);

    // Toggling never touches ENABLED_BY_DEFAULT
    core.set_category_enabled("a", false);
    assert_eq!(a.flags(), CategoryFlags::ENABLED_BY_DEFAULT);
    core.set_category_enabled("b", true);
    assert_eq!(b.flags(), CategoryFlags::ENABLED | CategoryFlags::ENABLED_BY_DEFAULT);
}

#[test]
fn test_flag_events() {
    let (_event_loop, core) = setup(Config::default());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    core.add_category_flags_handler(move |category, mask| {
        sink.lock().push((category.name().to_string(), category.is_enabled(), mask));
    });
    core.new_category("net", Level::Undefined, CategoryFlags::NONE);

    core.set_category_enabled("net", true);
    core.set_category_enabled("net", true);
    core.set_category_enabled("missing", true);
    core.set_category_enabled("net", false);

    assert_eq!(
        *events.lock(),
        vec![
            ("net".to_string(), true, CategoryFlags::ENABLED),
            ("net".to_string(), false, CategoryFlags::ENABLED),
        ]
    );
}

#[test]
fn test_level_events() {
    let (_event_loop, core) = setup(Config::default());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    core.add_category_level_handler(move |category| {
        sink.lock().push((category.name().to_string(), category.level()));
    });
    let net = core.new_category("net", Level::Undefined, CategoryFlags::ENABLED);

    core.set_category_level("net", Level::Debug);
    core.set_category_level("net", Level::Debug);
    core.set_category_level("missing", Level::Debug);
    core.set_category_level("net", Level::Undefined);

    assert_eq!(net.level(), Level::Undefined);
    assert_eq!(
        *events.lock(),
        vec![("net".to_string(), Level::Debug), ("net".to_string(), Level::Undefined)]
    );
}

#[test]
fn test_default_level() {
    let (_event_loop, core) = setup(Config::default());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    core.add_default_level_handler(move |level| sink.lock().push(level));

    assert_eq!(core.default_level(), Level::Info);
    assert!(!core.set_default_level(Level::Undefined));
    assert!(core.set_default_level(Level::Info));
    assert!(core.set_default_level(Level::Debug));
    assert_eq!(core.default_level(), Level::Debug);
    assert_eq!(*events.lock(), vec![Level::Debug]);
}

#[test]
fn test_undefined_configured_level_falls_back() {
    let (_event_loop, core) = setup(Config::default().default_level(Level::Undefined));
    assert_eq!(core.default_level(), Level::Info);
}

#[test]
fn test_backlog_propagation() {
    let (_event_loop, core) = setup(Config::default());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    core.add_backlog_handler(move |backlog| sink.lock().push(backlog));
    let (sender, _receiver, _collector) = subscribe(&core, "viewer");
    assert_eq!(sender.backlog(), Backlog::Limited(1000));

    core.set_backlog(5);
    core.set_backlog(5);
    assert_eq!(sender.backlog(), Backlog::Limited(5));
    assert_eq!(core.new_sender("later").unwrap().backlog(), Backlog::Limited(5));

    core.set_backlog(-3);
    assert_eq!(sender.backlog(), Backlog::Unlimited);
    core.set_backlog(0);
    assert_eq!(core.backlog(), Backlog::Limited(1000));

    assert_eq!(
        *events.lock(),
        vec![Backlog::Limited(5), Backlog::Unlimited, Backlog::Limited(1000)]
    );
}

#[test]
fn test_find_categories() {
    let (_event_loop, core) = setup(Config::default());
    for name in ["net.tcp", "disk", "net.udp", "net", "audio"] {
        core.new_category(name, Level::Undefined, CategoryFlags::ENABLED);
    }
    assert_eq!(names(&core.categories()), ["audio", "disk", "net", "net.tcp", "net.udp"]);
    assert_eq!(names(&core.find_categories(None)), names(&core.categories()));
    assert_eq!(names(&core.find_categories(Some(""))), names(&core.categories()));
    assert_eq!(names(&core.find_categories(Some("*"))), names(&core.categories()));
    assert_eq!(names(&core.find_categories(Some("net.*"))), ["net.tcp", "net.udp"]);
    assert_eq!(names(&core.find_categories(Some("?is?"))), ["disk"]);
    assert!(core.find_categories(Some("video*")).is_empty());
}

#[test]
fn test_snapshot_is_stable() {
    let (_event_loop, core) = setup(Config::default());
    core.new_category("a", Level::Undefined, CategoryFlags::ENABLED);
    let snapshot = core.categories();
    core.new_category("b", Level::Undefined, CategoryFlags::ENABLED);
    core.remove_category("a");
    assert_eq!(names(&snapshot), ["a"]);
    assert_eq!(names(&core.categories()), ["b"]);
}

#[test]
fn test_remove_categories() {
    let (_event_loop, core) = setup(Config::default());
    let removed = Arc::new(Mutex::new(Vec::new()));
    let sink = removed.clone();
    core.add_category_removed_handler(move |category| sink.lock().push(category.name().to_string()));
    for name in ["c", "a", "d", "b"] {
        core.new_category(name, Level::Undefined, CategoryFlags::ENABLED);
    }

    assert!(core.remove_category("d"));
    assert!(!core.remove_category("d"));
    core.remove_all_categories();
    assert!(core.categories().is_empty());
    assert_eq!(*removed.lock(), ["d", "a", "b", "c"]);

    // Ids keep counting after removal
    assert_eq!(core.new_category("a", Level::Undefined, CategoryFlags::NONE).id(), 5);
}

#[test]
fn test_removed_handlers_stay_quiet() {
    let (_event_loop, core) = setup(Config::default());
    let count = Arc::new(AtomicUsize::new(0));
    let c1 = count.clone();
    let added = core.add_category_added_handler(move |_| {
        c1.fetch_add(1, Ordering::SeqCst);
    });
    let c2 = count.clone();
    let level = core.add_default_level_handler(move |_| {
        c2.fetch_add(1, Ordering::SeqCst);
    });
    assert!(core.remove_handler(added));
    assert!(!core.remove_handler(added));
    core.remove_handlers(&[level]);

    core.new_category("a", Level::Undefined, CategoryFlags::NONE);
    core.set_default_level(Level::Error);
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn test_handler_may_reenter_core() {
    let (_event_loop, core) = setup(Config::default());
    let inner = core.clone();
    core.add_category_added_handler(move |category| {
        if category.name() == "parent" {
            inner.new_category("child", Level::Undefined, CategoryFlags::NONE);
        }
    });
    core.new_category("parent", Level::Undefined, CategoryFlags::NONE);
    assert_eq!(names(&core.categories()), ["child", "parent"]);
}

#[test]
fn test_remove_sender() {
    let (event_loop, core) = setup(Config::default());
    let (sender, _receiver, collector) = subscribe(&core, "viewer");
    assert!(core.remove_sender(&sender));
    assert!(!core.remove_sender(&sender));
    assert_eq!(core.sender_count(), 0);
    assert!(!core.log(Level::Error, None, "nobody listens"));

    sender.close(true);
    assert!(collector.wait_closed(&event_loop));
    assert_eq!(collector.message_count(), 0);
}

#[test]
fn test_closed_sender_detaches() {
    let (event_loop, core) = setup(Config::default());
    let (sender, _receiver, _collector) = subscribe(&core, "viewer");
    let (other_sender, _other_receiver, other) = subscribe(&core, "other");

    sender.close(true);
    assert!(event_loop.run_until(|| core.sender_count() == 1, common::TIMEOUT));
    assert!(!core.remove_sender(&sender));
    assert!(Arc::ptr_eq(&core.senders()[0], &other_sender));

    core.log(Level::Info, None, "still delivered");
    assert!(other.wait_messages(&event_loop, 1));
}

#[test]
fn test_vanished_subscriber_detaches() {
    let (event_loop, core) = setup(Config::default());
    let sender = core.new_sender("gone").unwrap();
    drop(sender.take_peer());
    core.log(Level::Info, None, "into the void");
    assert!(event_loop.run_until(|| core.sender_count() == 0, common::TIMEOUT));
    assert!(sender.is_closed());
}

#[test]
fn test_log_fmt_is_lazy() {
    struct Counted<'a>(&'a AtomicUsize);

    impl fmt::Display for Counted<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            self.0.fetch_add(1, Ordering::SeqCst);
            f.write_str("counted")
        }
    }

    let (event_loop, core) = setup(Config::default());
    let formatted = AtomicUsize::new(0);
    assert!(!core.log_fmt(Level::Info, None, format_args!("{}", Counted(&formatted))));
    assert_eq!(formatted.load(Ordering::SeqCst), 0);

    let (_sender, _receiver, collector) = subscribe(&core, "viewer");
    assert!(!core.log_fmt(Level::Verbose, None, format_args!("{}", Counted(&formatted))));
    assert_eq!(formatted.load(Ordering::SeqCst), 0);
    assert!(core.log_fmt(Level::Info, None, format_args!("{} {}", Counted(&formatted), 7)));
    assert_eq!(formatted.load(Ordering::SeqCst), 1);

    assert!(collector.wait_messages(&event_loop, 1));
    assert_eq!(collector.texts(), ["counted 7"]);
}

#[test]
fn test_concurrent_producers_keep_order() {
    let (event_loop, core) = setup(Config::default().backlog(-1));
    let (_sender, _receiver, collector) = subscribe(&core, "viewer");

    let threads: Vec<_> = (0..4)
        .map(|t| {
            let core = core.clone();
            std::thread::spawn(move || {
                for i in 0..250 {
                    core.log(Level::Info, None, &format!("thread {} line {}", t, i));
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    assert!(collector.wait_messages(&event_loop, 1000));
    assert_eq!(collector.indices(), (0..1000).collect::<Vec<u32>>());
    assert_eq!(collector.skipped(), 0);
}

#[test]
fn test_stalled_subscriber_does_not_block_others() {
    let (event_loop, core) = setup(Config::default().backlog(5));
    let (_fast, _fast_receiver, fast) = subscribe(&core, "fast");
    let (_slow, slow_receiver, slow) = subscribe(&core, "slow");
    slow_receiver.pause();

    for i in 0..200 {
        core.log(Level::Info, None, &format!("line {}", i));
        event_loop.run_pending();
    }
    assert!(fast.wait_messages(&event_loop, 200));
    assert_eq!(fast.skipped(), 0);

    slow_receiver.resume();
    assert!(event_loop.run_until(|| slow.indices().last() == Some(&199), common::TIMEOUT));
    assert_eq!(slow.message_count() as u32 + slow.skipped(), 200);
}
