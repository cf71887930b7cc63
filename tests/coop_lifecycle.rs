use conclave::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct Counting {
    starts: Arc<AtomicUsize>,
    finishes: Arc<AtomicUsize>,
}

impl Agent for Counting {
    fn so_evt_start(&mut self, _ctx: &AgentContext) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn so_evt_finish(&mut self, _ctx: &AgentContext) {
        self.finishes.fetch_add(1, Ordering::SeqCst);
    }
}

struct FailingDefine;

impl Agent for FailingDefine {
    fn so_define_agent(&mut self, _ctx: &AgentContext) -> Result<()> {
        Err(Error::NotSupported("this agent refuses to be defined"))
    }
}

#[test]
fn failed_registration_rolls_back_without_side_effects() {
    let starts = Arc::new(AtomicUsize::new(0));
    let finishes = Arc::new(AtomicUsize::new(0));

    {
        let starts = Arc::clone(&starts);
        let finishes = Arc::clone(&finishes);
        launch(move |env| {
            let mut broken = env.create_coop("broken");
            broken.add_agent(Counting {
                starts: Arc::clone(&starts),
                finishes: Arc::clone(&finishes),
            });
            broken.add_agent(FailingDefine);
            assert!(matches!(
                env.register_coop(broken),
                Err(Error::RegistrationFailed(_))
            ));

            // The name is free again after the rollback.
            let mut retry = env.create_coop("broken");
            retry.add_agent(Counting { starts, finishes });
            env.register_coop(retry)?;
            env.deregister_coop("broken", DeregReason::Normal)
        })
        .expect("environment shuts down normally");
    }

    // Only the retry cooperation's agent ever ran.
    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert_eq!(finishes.load(Ordering::SeqCst), 1);
}

#[test]
fn duplicate_and_empty_coops_are_rejected() {
    launch(|env| {
        let empty = env.create_coop("empty");
        assert!(matches!(
            env.register_coop(empty),
            Err(Error::EmptyCoop(_))
        ));

        let mut first = env.create_coop("taken");
        first.add_agent(Counting {
            starts: Arc::new(AtomicUsize::new(0)),
            finishes: Arc::new(AtomicUsize::new(0)),
        });
        env.register_coop(first)?;

        let mut second = env.create_coop("taken");
        second.add_agent(Counting {
            starts: Arc::new(AtomicUsize::new(0)),
            finishes: Arc::new(AtomicUsize::new(0)),
        });
        assert!(matches!(
            env.register_coop(second),
            Err(Error::CoopNameInUse(_))
        ));

        env.deregister_coop("taken", DeregReason::Normal)
    })
    .expect("environment shuts down normally");
}

#[test]
fn parent_deregistration_cascades_to_children() {
    let order = Arc::new(Mutex::new(Vec::new()));

    {
        let order = Arc::clone(&order);
        launch(move |env| {
            let mut parent = env.create_coop("parent");
            parent.add_agent(Counting {
                starts: Arc::new(AtomicUsize::new(0)),
                finishes: Arc::new(AtomicUsize::new(0)),
            });
            let order_parent = Arc::clone(&order);
            parent.add_dereg_notificator(Box::new(move |_env, name, _reason| {
                order_parent.lock().unwrap().push(name.to_string());
            }));
            env.register_coop(parent)?;

            let mut child = env.create_coop("child");
            child.set_parent("parent");
            child.add_agent(Counting {
                starts: Arc::new(AtomicUsize::new(0)),
                finishes: Arc::new(AtomicUsize::new(0)),
            });
            let order_child = Arc::clone(&order);
            child.add_dereg_notificator(Box::new(move |_env, name, reason| {
                assert_eq!(reason, DeregReason::ParentDeregistration);
                order_child.lock().unwrap().push(name.to_string());
            }));
            env.register_coop(child)?;

            env.deregister_coop("parent", DeregReason::Normal)
        })
        .expect("environment shuts down normally");
    }

    // The child finalizes strictly before its parent.
    assert_eq!(*order.lock().unwrap(), vec!["child", "parent"]);
}

#[test]
fn disposers_and_notificators_run_at_the_right_moments() {
    let registered = Arc::new(AtomicUsize::new(0));
    let deregistered = Arc::new(AtomicUsize::new(0));
    let disposed = Arc::new(AtomicUsize::new(0));

    struct Disposable(Arc<AtomicUsize>);
    impl Drop for Disposable {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    {
        let registered = Arc::clone(&registered);
        let deregistered = Arc::clone(&deregistered);
        let disposed = Arc::clone(&disposed);
        launch(move |env| {
            let mut coop = env.create_coop("with_resources");
            coop.add_agent(Counting {
                starts: Arc::new(AtomicUsize::new(0)),
                finishes: Arc::new(AtomicUsize::new(0)),
            });
            coop.take_under_control(Disposable(Arc::clone(&disposed)));

            let registered_cb = Arc::clone(&registered);
            coop.add_reg_notificator(Box::new(move |_env, _name| {
                registered_cb.fetch_add(1, Ordering::SeqCst);
            }));
            let deregistered_cb = Arc::clone(&deregistered);
            coop.add_dereg_notificator(Box::new(move |_env, _name, _reason| {
                deregistered_cb.fetch_add(1, Ordering::SeqCst);
            }));

            env.register_coop(coop)?;
            assert_eq!(registered.load(Ordering::SeqCst), 1);
            assert_eq!(disposed.load(Ordering::SeqCst), 0);

            env.deregister_coop("with_resources", DeregReason::User(42))
        })
        .expect("environment shuts down normally");
    }

    assert_eq!(registered.load(Ordering::SeqCst), 1);
    assert_eq!(deregistered.load(Ordering::SeqCst), 1);
    assert_eq!(disposed.load(Ordering::SeqCst), 1);
}

#[test]
fn shutdown_releases_every_agent() {
    struct Held;
    let held = Arc::new(Held);
    let observer = Arc::downgrade(&held);

    struct Holder {
        _held: Arc<Held>,
    }
    impl Agent for Holder {}

    launch(move |env| {
        let mut coop = env.create_coop("holder");
        coop.add_agent(Holder { _held: held });
        env.register_coop(coop)?;
        env.deregister_coop("holder", DeregReason::Normal)
    })
    .expect("environment shuts down normally");

    // After launch returns every agent has been destroyed, so the resource
    // it held is gone as well.
    assert!(observer.upgrade().is_none());
}
