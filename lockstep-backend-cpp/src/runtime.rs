//! The C++ runtime header every emitted module includes.
//!
//! It provides reference-counted objects with a per-thread reentrant
//! read/write lock, scoped guards, and the sync/result/message/queue
//! interfaces the generated message and proxy classes build on.

const PRELUDE: &str = r#"#pragma once
#include <any>
#include <atomic>
#include <condition_variable>
#include <cstddef>
#include <deque>
#include <mutex>
#include <string>
#include <thread>
#include <utility>

namespace lockstep {

constexpr int CONTENDING_WRITER = 1 << 0;
constexpr int CONTENDING_READER = 1 << 1;

"#;

const LOCK: &str = r#"// Read/write lock, reentrant for the thread that owns it. A sole reader may
// upgrade to a writer. try_* return 0 on success or a contention flag.
class Lock {
  std::mutex guard;
  std::condition_variable readers_have_left;
  std::condition_variable writer_has_left;
  std::atomic<std::thread::id> owner{std::thread::id()};
  std::atomic<int> readers{0};
  unsigned write_count = 0;

public:
  Lock() = default;
  Lock(const Lock&) = delete;
  Lock& operator=(const Lock&) = delete;

  void rlock() {
    const std::thread::id me = std::this_thread::get_id();
    if (owner.load() == me) {
      ++readers;
      return;
    }
    std::unique_lock<std::mutex> hold(guard);
    writer_has_left.wait(hold, [this] { return write_count == 0; });
    owner = readers++ == 0 ? me : std::thread::id();
  }

  int try_rlock() {
    const std::thread::id me = std::this_thread::get_id();
    if (owner.load() == me) {
      ++readers;
      return 0;
    }
    std::lock_guard<std::mutex> hold(guard);
    if (write_count > 0) {
      return CONTENDING_WRITER;
    }
    owner = readers++ == 0 ? me : std::thread::id();
    return 0;
  }

  void unrlock() {
    std::lock_guard<std::mutex> hold(guard);
    if (--readers == 0) {
      if (write_count == 0) {
        owner = std::thread::id();
      }
      readers_have_left.notify_all();
    }
  }

  void wlock() {
    const std::thread::id me = std::this_thread::get_id();
    if (owner.load() == me && write_count > 0) {
      ++write_count;
      return;
    }
    std::unique_lock<std::mutex> hold(guard);
    if (owner.load() != me) {
      readers_have_left.wait(hold, [this] { return readers.load() == 0; });
      writer_has_left.wait(hold, [this] { return write_count == 0; });
      owner = me;
    }
    ++write_count;
  }

  int try_wlock() {
    const std::thread::id me = std::this_thread::get_id();
    if (owner.load() == me && write_count > 0) {
      ++write_count;
      return 0;
    }
    std::lock_guard<std::mutex> hold(guard);
    if (owner.load() != me) {
      if (readers.load() > 0) {
        return CONTENDING_READER;
      }
      if (write_count > 0) {
        return CONTENDING_WRITER;
      }
      owner = me;
    }
    ++write_count;
    return 0;
  }

  void unwlock() {
    std::lock_guard<std::mutex> hold(guard);
    if (--write_count == 0) {
      if (readers.load() == 0) {
        owner = std::thread::id();
      }
      writer_has_left.notify_all();
    }
  }
};

"#;

const OBJECT: &str = r#"class Object {
  mutable std::atomic<int> refcount{1};
  mutable Lock lock;

public:
  Object() = default;
  Object(const Object&) = delete;
  Object& operator=(const Object&) = delete;
  virtual ~Object() = default;

  void retain() const { refcount.fetch_add(1, std::memory_order_relaxed); }

  // Returns true when this call destroyed the object.
  bool release() const {
    if (refcount.fetch_sub(1, std::memory_order_release) == 1) {
      std::atomic_thread_fence(std::memory_order_acquire);
      delete this;
      return true;
    }
    return false;
  }

  // Retain unless the count already reached zero.
  bool retain_if_alive() const {
    int count = refcount.load(std::memory_order_relaxed);
    while (count > 0) {
      if (refcount.compare_exchange_weak(count, count + 1, std::memory_order_acq_rel)) {
        return true;
      }
    }
    return false;
  }

  int ref_count() const { return refcount.load(std::memory_order_relaxed); }

  void rlock() const { lock.rlock(); }
  void wlock() const { lock.wlock(); }
  void unrlock() const { lock.unrlock(); }
  void unwlock() const { lock.unwlock(); }
  int try_rlock() const { return lock.try_rlock(); }
  int try_wlock() const { return lock.try_wlock(); }
};

template <typename T>
inline void retain(T* ob) {
  if (ob != nullptr) {
    ob->retain();
  }
}

template <typename T>
inline void release(T*& ob) {
  if (ob != nullptr && ob->release()) {
    ob = nullptr;
  }
}

class rlock_guard {
  const Object* ob;

public:
  explicit rlock_guard(const Object* ob) : ob(ob) {
    if (ob != nullptr) {
      ob->rlock();
    }
  }
  rlock_guard(const rlock_guard&) = delete;
  rlock_guard& operator=(const rlock_guard&) = delete;
  ~rlock_guard() {
    if (ob != nullptr) {
      ob->unrlock();
    }
  }
};

class wlock_guard {
  const Object* ob;

public:
  explicit wlock_guard(const Object* ob) : ob(ob) {
    if (ob != nullptr) {
      ob->wlock();
    }
  }
  wlock_guard(const wlock_guard&) = delete;
  wlock_guard& operator=(const wlock_guard&) = delete;
  ~wlock_guard() {
    if (ob != nullptr) {
      ob->unwlock();
    }
  }
};

template <typename F>
class scope_exit {
  F f;

public:
  explicit scope_exit(F f) : f(std::move(f)) {}
  scope_exit(const scope_exit&) = delete;
  scope_exit& operator=(const scope_exit&) = delete;
  ~scope_exit() { f(); }
};

"#;

const INTERFACES: &str = r#"enum class Activation { Deferred, Activated, Abandoned };

struct SyncInterface : public Object {
  virtual bool is_activable() const = 0;
  virtual bool is_completed() const = 0;
  virtual void insert_activity() = 0;
  virtual void remove_activity() = 0;
};

struct ResultInterface : public Object {
  virtual bool is_ready() const = 0;
  virtual void push_int(long value) = 0;
  virtual long get_int() const = 0;
  virtual void push_pointer(Object* value) = 0;
  virtual Object* get_pointer() const = 0;
  virtual void push_value(std::any value) = 0;
  virtual std::any take_value() = 0;
};

using ResultFactory = ResultInterface* (*)();

struct MessageInterface : public Object {
  SyncInterface* sync;
  ResultInterface* result;

  MessageInterface(SyncInterface* sync, ResultInterface* result) : sync(sync), result(result) {
    lockstep::retain(sync);
    lockstep::retain(result);
  }
  ~MessageInterface() override {
    lockstep::release(sync);
    lockstep::release(result);
  }

  virtual Activation activate() = 0;

protected:
  // Optimistic admission: Deferred while the sync is busy, Abandoned once it
  // says the work is no longer wanted. An abandoned message no longer counts
  // as activity.
  Activation admission() {
    if (sync == nullptr) {
      return Activation::Activated;
    }
    if (sync->try_rlock() != 0) {
      return Activation::Deferred;
    }
    const bool activable = sync->is_activable();
    sync->unrlock();
    if (!activable) {
      finish();
      return Activation::Abandoned;
    }
    return Activation::Activated;
  }

  void finish() {
    if (sync != nullptr) {
      sync->wlock();
      sync->remove_activity();
      sync->unwlock();
    }
  }
};

struct DrainReport {
  std::size_t activated = 0;
  std::size_t abandoned = 0;
  std::size_t deferred = 0;
};

struct QueueInterface : public Object {
  virtual void push(MessageInterface* message) = 0;
  virtual DrainReport activate() = 0;
  virtual bool is_empty() const = 0;
};

"#;

const DEFAULTS: &str = r#"class OneShotResult : public ResultInterface {
  bool ready = false;
  long int_value = 0;
  Object* pointer = nullptr;
  std::any value;

public:
  static ResultInterface* create() { return new OneShotResult(); }

  ~OneShotResult() override { lockstep::release(pointer); }

  bool is_ready() const override { return ready; }

  void push_int(long v) override {
    if (!ready) {
      int_value = v;
      ready = true;
    }
  }
  long get_int() const override { return int_value; }

  void push_pointer(Object* v) override {
    if (!ready) {
      pointer = v;
      ready = true;
    } else {
      lockstep::release(v);
    }
  }
  Object* get_pointer() const override {
    lockstep::retain(pointer);
    return pointer;
  }

  void push_value(std::any v) override {
    if (!ready) {
      value = std::move(v);
      ready = true;
    }
  }
  std::any take_value() override { return std::exchange(value, std::any()); }
};

// FIFO queue. A drain takes the pending batch and runs it without holding the
// queue lock; deferred messages go back ahead of anything pushed meanwhile.
class FifoQueue : public QueueInterface {
  std::deque<MessageInterface*> pending;
  std::atomic<std::size_t> count{0};

public:
  ~FifoQueue() override {
    for (MessageInterface* m : pending) {
      lockstep::release(m);
    }
  }

  void push(MessageInterface* message) override {
    wlock_guard hold(this);
    pending.push_back(message);
    ++count;
  }

  DrainReport activate() override {
    std::deque<MessageInterface*> batch;
    {
      wlock_guard hold(this);
      batch.swap(pending);
    }
    DrainReport report;
    std::deque<MessageInterface*> deferred;
    for (MessageInterface* m : batch) {
      switch (m->activate()) {
      case Activation::Activated:
        ++report.activated;
        --count;
        lockstep::release(m);
        break;
      case Activation::Abandoned:
        ++report.abandoned;
        --count;
        lockstep::release(m);
        break;
      case Activation::Deferred:
        ++report.deferred;
        deferred.push_back(m);
        break;
      }
    }
    if (!deferred.empty()) {
      wlock_guard hold(this);
      pending.insert(pending.begin(), deferred.begin(), deferred.end());
    }
    return report;
  }

  bool is_empty() const override { return count.load() == 0; }
};

// Mixin for activable classes: the default queue, the result factory and the
// slot of the single live proxy.
class ActivableBase {
public:
  QueueInterface* queue = nullptr;
  ResultFactory result_factory = &OneShotResult::create;
  Object* proxy = nullptr;
  std::mutex proxy_guard;

  virtual ~ActivableBase() { lockstep::release(queue); }

  QueueInterface* default_queue() {
    if (queue == nullptr) {
      queue = new FifoQueue();
    }
    return queue;
  }

  // Called by a proxy's destructor so a later activation builds a new one.
  void forget_proxy(const Object* gone) {
    std::lock_guard<std::mutex> hold(proxy_guard);
    if (proxy == gone) {
      proxy = nullptr;
    }
  }
};

// Return the live proxy of `object` with one more reference, or build it.
template <typename P, typename T>
P* activate_once(T* object, QueueInterface* queue, ResultFactory factory) {
  std::lock_guard<std::mutex> hold(object->proxy_guard);
  if (object->proxy != nullptr && object->proxy->retain_if_alive()) {
    return dynamic_cast<P*>(object->proxy);
  }
  P* proxy = new P(object, queue != nullptr ? queue : object->default_queue(),
                   factory != nullptr ? factory : object->result_factory);
  object->proxy = proxy;
  return proxy;
}

} // namespace lockstep
"#;

pub fn emit_runtime_h() -> String {
    let mut out = String::new();
    out.push_str(PRELUDE);
    out.push_str(LOCK);
    out.push_str(OBJECT);
    out.push_str(INTERFACES);
    out.push_str(DEFAULTS);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_declares_the_runtime_contract() {
        let h = emit_runtime_h();
        assert!(h.starts_with("#pragma once"));
        for needle in [
            "CONTENDING_WRITER",
            "CONTENDING_READER",
            "class rlock_guard",
            "class wlock_guard",
            "struct SyncInterface",
            "struct ResultInterface",
            "struct MessageInterface",
            "struct QueueInterface",
            "class ActivableBase",
            "P* activate_once",
        ] {
            assert!(h.contains(needle), "missing {needle}");
        }
        assert!(h.trim_end().ends_with("} // namespace lockstep"));
    }

    #[test]
    fn abandoned_messages_retire_their_activity() {
        let h = emit_runtime_h();
        assert!(h.contains("    if (!activable) {\n      finish();\n      return Activation::Abandoned;\n    }\n"));
    }
}
